use std::env;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

fn probe(cmd: &str, args: &[&str]) -> Option<String> {
    let out = Command::new(cmd).args(args).output().ok()?;
    if !out.status.success() {
        return None;
    }
    let s = String::from_utf8_lossy(&out.stdout).trim().to_string();
    (!s.is_empty()).then_some(s)
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");

    // SOURCE_DATE_EPOCH wins so packaged builds are reproducible.
    let stamp = match env::var("SOURCE_DATE_EPOCH") {
        Ok(sde) => format!("epoch:{}", sde.trim()),
        Err(_) => {
            let secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            format!("epoch:{secs}")
        }
    };

    let host = env::var("HOSTNAME")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| probe("hostname", &[]))
        .unwrap_or_else(|| "unknown".to_string());

    let commit = probe("git", &["rev-parse", "--short", "HEAD"]).unwrap_or_else(|| "-".to_string());

    println!("cargo:rustc-env=PIDMASTER_BUILD_TIME={stamp}");
    println!("cargo:rustc-env=PIDMASTER_BUILD_HOST={host}");
    println!("cargo:rustc-env=PIDMASTER_BUILD_COMMIT={commit}");
}
