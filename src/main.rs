use clap::Parser;
use dotenv::dotenv;
use tracing::error;

use strategy_runtime::app::bootstrap::{self, RunOptions};
use strategy_runtime::app_config::log::setup_logging;

#[derive(Parser, Debug)]
#[command(name = "strategy_runtime", about = "策略执行运行时")]
struct Cli {
    /// 启动后立即运行的策略ID，可重复
    #[arg(long = "start", num_args = 1..)]
    start: Vec<String>,

    /// 策略定义 JSON 文件，覆盖 STRATEGY_DEFINITIONS_PATH
    #[arg(long)]
    definitions: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    setup_logging()?;

    let cli = Cli::parse();
    let options = RunOptions {
        start: cli.start,
        definitions: cli.definitions,
    };
    if let Err(e) = bootstrap::run(options).await {
        error!("运行时异常退出: {}", e);
        return Err(e);
    }
    Ok(())
}
