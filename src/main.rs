use std::{error::Error, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};
use noteport_kernel::{
    discover_kernels, start_kernel, start_kernel_directly, ClientConfig, KernelClient,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the kernels installed in an environment.
    Kernels {
        #[arg(long)]
        env: PathBuf,
    },
    /// Start or attach to a kernel and execute code on it.
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Environment root containing `bin/jupyter`.
    #[arg(long, required_unless_present = "connection_file")]
    env: Option<PathBuf>,
    /// Kernel to launch; uses `start_kernel.sh` when omitted.
    #[arg(long, requires = "env")]
    kernel: Option<String>,
    /// Attach to an already running kernel instead of starting one.
    #[arg(long, conflicts_with_all = ["env", "kernel"])]
    connection_file: Option<PathBuf>,
    /// Fail an execution that runs longer than this many seconds.
    #[arg(long)]
    deadline_secs: Option<u64>,
    /// Code cells, executed in order.
    #[arg(required = true)]
    code: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Command::Kernels { env } => {
            let kernels = discover_kernels(&env).await;
            if kernels.is_empty() {
                println!("no kernels found in {}", env.display());
            }
            for spec in kernels.values() {
                println!("{spec}");
            }
        }
        Command::Run(args) => run(args).await?,
    }

    Ok(())
}

async fn run(args: RunArgs) -> Result<(), Box<dyn Error>> {
    let mut config = ClientConfig::from_env();
    if let Some(secs) = args.deadline_secs {
        config = config.execution_deadline(Some(Duration::from_secs(secs)));
    }

    let mut client = match (args.connection_file, args.env, args.kernel) {
        (Some(path), _, _) => {
            let client = KernelClient::connect(&path, config).await?;
            client.wait_until_ready().await?;
            client
        }
        (None, Some(env), Some(kernel)) => start_kernel(&kernel, &env, config).await?,
        (None, Some(env), None) => start_kernel_directly(&env, config).await?,
        (None, None, _) => return Err("either --env or --connection-file is required".into()),
    };
    info!(pid = ?client.kernel_pid(), "kernel ready");

    let mut statuses = client.subscribe_status();
    let printer = tokio::spawn(async move {
        while let Some(status) = statuses.recv().await {
            eprintln!("[kernel {status}]");
        }
    });

    for cell in args.code {
        let output = client.execute(cell).await;
        println!("{output}");
    }

    client.shutdown().await;
    printer.abort();

    Ok(())
}
