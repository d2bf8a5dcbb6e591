use cloudsyncd::daemon::{DaemonConfig, DaemonRuntime, StatusReport, StoreLocation, answer_issue};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Run,
    Status,
    Answer { issue_id: i64, choice: String },
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    let mut args = args.into_iter().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--status" => mode = CliMode::Status,
            "--answer" => {
                let (Some(issue_id), Some(choice)) = (args.next(), args.next()) else {
                    anyhow::bail!("--answer needs an issue id and a choice");
                };
                let issue_id = issue_id
                    .parse::<i64>()
                    .map_err(|_| anyhow::anyhow!("invalid issue id: {issue_id}"))?;
                mode = CliMode::Answer { issue_id, choice };
            }
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match parse_cli_mode(std::env::args())? {
        CliMode::Help => {
            println!("Usage: cloudsyncd [--status | --answer <issue-id> <choice>]");
            println!("  --status   Print queued records and open issues, then exit");
            println!("  --answer   Answer an open issue (retry, cancel, overwrite, keep_both)");
            return Ok(());
        }
        CliMode::Answer { issue_id, choice } => {
            let location = StoreLocation::from_env()?;
            let issue = answer_issue(&location, issue_id, &choice).await?;
            println!("issue {}: {} answered", issue.issue_id, issue.issue.title);
            return Ok(());
        }
        CliMode::Status => {
            let location = StoreLocation::from_env()?;
            let report = StatusReport::load(&location).await?;
            print!("{}", report.render());
            return Ok(());
        }
        CliMode::Run => {}
    }
    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    daemon.run().await
}
