// Konsolen-Client; Konfiguration über Umgebungsvariablen (siehe `config`)
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rtc_call::run().await
}
