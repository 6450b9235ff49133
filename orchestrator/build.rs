//! Embeds the source revision and build date reported by `vpsctl version`

use std::process::Command;

use chrono::Utc;

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn main() {
    let revision = git(&["describe", "--always", "--dirty", "--abbrev=10"])
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=VPSCTL_GIT_REV={}", revision);
    println!(
        "cargo:rustc-env=VPSCTL_BUILD_DATE={}",
        Utc::now().format("%Y-%m-%dT%H:%M:%SZ")
    );

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=build.rs");
}
