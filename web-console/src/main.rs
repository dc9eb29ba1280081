use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    code_web_console::run_main().await
}
