use clap::Parser;

fn main() {
    env_logger::init();
    let args = sandbox_worker::cli::Cli::parse();
    sandbox_worker::run(args);
}
