use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");

    let date_args = match env::var("SOURCE_DATE_EPOCH") {
        Ok(epoch) if !epoch.trim().is_empty() => {
            vec!["-u".to_owned(), "-d".to_owned(), format!("@{}", epoch.trim()), "+%Y-%m-%dT%H:%M:%SZ".to_owned()]
        }
        _ => vec!["-u".to_owned(), "+%Y-%m-%dT%H:%M:%SZ".to_owned()],
    };

    let build_date = Command::new("date")
        .args(&date_args)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "unknown".to_owned());

    println!("cargo:rustc-env=HERA_MASTER_BUILD_DATE_UTC={build_date}");
}
