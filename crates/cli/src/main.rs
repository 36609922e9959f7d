fn main() {
    if let Err(error) = enscale_cli::run_from_env() {
        if enscale_core::error::is_canceled(&error) {
            eprintln!("canceled");
            std::process::exit(130);
        }
        tracing::error!("{error:#}");
        std::process::exit(1);
    }
}
