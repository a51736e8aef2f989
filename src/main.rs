use mmrecipes::cli::{parse_args, setup_logging};
use mmrecipes::recipes;
use tracing::info;

fn main() {
    let cli = parse_args();

    setup_logging(cli.verbose);

    info!("{}", mmrecipes::info());

    let config = cli.into_run_config();
    let report = recipes::run(&config);

    if let Some(metrics) = &report.metrics {
        for (name, value) in metrics {
            info!("{}: {:.4}", name, value);
        }
    }
}
