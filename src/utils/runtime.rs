use std::process;

const APP_DESCRIPTION: &str = "Multi-server worker for the Gearman job queue protocol.";

pub fn ensure_posix_or_exit() {
    if !cfg!(unix) {
        eprintln!("unsupported platform: gearman-worker relies on poll(2) and POSIX signals");
        process::exit(2);
    }
}

pub fn build_info() -> String {
    format!(
        "{} v{} | build {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("GEARMAN_WORKER_BUILD_DATE_UTC")
    )
}

pub fn print_startup_banner() {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;66m";

    println!("{BANNER_COLOR}{}{RESET}", build_info());
    println!("{APP_DESCRIPTION}");
    println!();
}
