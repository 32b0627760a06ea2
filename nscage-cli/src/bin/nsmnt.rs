use std::{env, process};

fn main() {
    nscage_cli::init_tracing();
    let args: Vec<String> = env::args().collect();
    process::exit(nscage_cli::runner::run_mount(args));
}
