mod error;
mod llm;
mod session;
mod settings;
mod utility;

use llm::load_llm::Capabilities;
use llm::HubLoader;
use session::Session;
use settings::Settings;
use tracing_subscriber::EnvFilter;

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> error::Result<()> {
    let settings = Settings::new()?;
    init_tracing(&settings.log.level);
    tracing::debug!(?settings, "settings loaded");

    let stdin = std::io::stdin();
    let mut input = stdin.lock();
    let mut output = std::io::stdout();

    let mut loader = HubLoader::new(settings.llm.clone());
    let mut session = Session::start(
        settings.llm.mode,
        settings.llm.cpu,
        Capabilities::probe(),
        settings.llm.max_new_tokens,
        &mut loader,
        &mut input,
        &mut output,
    )?;
    session.run(&mut input, &mut output)?;
    Ok(())
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
