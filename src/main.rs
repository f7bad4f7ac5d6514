use clap::Parser;

fn main() {
    let args = unlk::cli::Args::parse();
    if let Err(err) = unlk::run(args) {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}
