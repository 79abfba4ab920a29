//! Application server entry point. Grounded on `syncserver`'s `main.rs`: docopt argument parsing,
//! structured logging bootstrap, Sentry init, then await the bound server future.
#[macro_use]
extern crate slog_scope;

use std::error::Error;
use std::sync::Arc;

use docopt::Docopt;
use serde::Deserialize;

use apphost::integration::IntegrationRegistry;
use apphost::logging;
use apphost::pages::FailFastDemoPage;
use apphost::pipeline::HttpMethod;
use apphost::server::routes::{PageRegistry, PageRoute};
use apphost::server::Server;
use apphost_settings::Settings;

const USAGE: &str = "
Usage: apphost [options]

Options:
    -h, --help               Show this message.
    --config=CONFIGFILE      Application server configuration file path.
";

#[derive(Debug, Deserialize)]
struct Args {
    flag_config: Option<String>,
}

#[actix_web::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());
    let settings = Settings::with_env_and_config_file(args.flag_config.as_deref())?;
    logging::init_logging(!settings.human_logs).expect("logging failed to initialize");
    debug!("Starting up...");

    let _sentry = sentry::init(sentry::ClientOptions {
        release: sentry::release_name!(),
        ..sentry::ClientOptions::default()
    });

    let banner = settings.banner();
    let pages = PageRegistry::new().register(PageRoute {
        path: "/demo/fail-fast/".to_owned(),
        methods: vec![HttpMethod::Put],
        handler_name: "fail_fast_demo",
        factory: Arc::new(|client| {
            Box::new(FailFastDemoPage::new(client, "fail-fast-demo")) as Box<dyn apphost::pipeline::Page>
        }),
    });
    let server = Server::with_settings(settings, IntegrationRegistry::new(), pages).await?;
    info!("Server running on {}", banner);
    server.await?;
    info!("Server closing");
    logging::reset_logging();

    Ok(())
}
