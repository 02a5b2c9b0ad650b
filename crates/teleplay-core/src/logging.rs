use crate::Result;

/// Filter used when `RUST_LOG` is unset: info for our crates and the named
/// service, warn for everything else.
pub fn default_filter(service_name: &str) -> String {
    format!(
        "warn,teleplay=info,teleplay_core=info,teleplay_telegram=info,{}=info",
        service_name.replace('-', "_")
    )
}

/// Initialize tracing for the bot.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init(service_name: &str) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(service_name)));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(true)
        .try_init();

    Ok(())
}
