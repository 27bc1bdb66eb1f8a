use pmoconfig::Config;
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Installe le subscriber global.
///
/// Le niveau vient de `host.logger.min_level`, `RUST_LOG` a priorité.
/// La sortie console peut être coupée par `host.logger.enable_console`.
pub fn init_logging(config: &Config) {
    let level = config.get_log_min_level().to_lowercase();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{level},hyper=warn,reqwest=warn"))
    });

    let subscriber = Registry::default().with(filter);

    if config.get_log_enable_console() {
        subscriber
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_ansi(true),
            )
            .init();
    } else {
        subscriber.init();
    }
}
