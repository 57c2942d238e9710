pub fn print_startup_banner() {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;136m";
    const DIM_GRAY: &str = "\x1b[2;90m";
    const BANNER: &str = r#"
 _                                               _
| |__   ___ _ __ __ _       _ __ ___   __ _ ___| |_ ___ _ __
| '_ \ / _ \ '__/ _` |_____| '_ ` _ \ / _` / __| __/ _ \ '__|
| | | |  __/ | | (_| |_____| | | | | | (_| \__ \ ||  __/ |
|_| |_|\___|_|  \__,_|     |_| |_| |_|\__,_|___/\__\___|_|"#;
    const APP_DESCRIPTION: &str =
        "Job scheduler master: worker connections, command dispatch and result write-back over TCP.";
    const LIABILITY_NOTICE: &str =
        "MIT License disclaimer: software is provided \"AS IS\", without warranty or liability.";

    println!("{BANNER_COLOR}{BANNER}{RESET}");
    println!();
    println!(
        "{} v{} | build {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("HERA_MASTER_BUILD_DATE_UTC")
    );
    println!("{APP_DESCRIPTION}");
    println!("{DIM_GRAY}{LIABILITY_NOTICE}{RESET}");
    println!();
    println!("================================================================");
    println!();
}
