use kselect::process::{run, Args, KSelectError};

use clap::Parser;
use env_logger::Builder;
use log::{info, LevelFilter};
use rayon::ThreadPoolBuilder;

fn main() -> Result<(), KSelectError> {
    Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();

    let threads = args.threads.unwrap_or_else(num_cpus::get);
    ThreadPoolBuilder::new().num_threads(threads).build_global()?;
    info!("Using {} threads", threads);

    run(&args)
}
