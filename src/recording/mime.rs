//! Auswahl des Aufnahme-Formats

/// Kandidaten in absteigender Priorität
pub const CANDIDATE_MIME_TYPES: [&str; 6] = [
    "audio/webm;codecs=opus",
    "audio/ogg;codecs=opus",
    "audio/mp4",
    "audio/webm",
    "audio/ogg",
    "audio/wav",
];

/// Erster unterstützter Kandidat
pub fn select_mime_type(is_supported: impl Fn(&str) -> bool) -> Option<&'static str> {
    CANDIDATE_MIME_TYPES
        .iter()
        .copied()
        .find(|mime| is_supported(mime))
}

/// Dateiendung passend zum Container (Codec-Parameter werden ignoriert)
pub fn extension_for(mime_type: &str) -> &'static str {
    let container = mime_type
        .split(';')
        .next()
        .unwrap_or(mime_type)
        .trim()
        .to_ascii_lowercase();

    match container.as_str() {
        "audio/webm" => "webm",
        "audio/ogg" => "ogg",
        "audio/mp4" => "m4a",
        "audio/wav" | "audio/x-wav" | "audio/wave" => "wav",
        _ => "bin",
    }
}
