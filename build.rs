use std::process::Command;

fn main() {
    println!("cargo:rustc-env=BUILD_TIMESTAMP={}", build_timestamp());
    println!("cargo:rustc-env=BUILD_GIT_SHA={}", git_sha());

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");
}

fn command_output(program: &str, args: &[&str]) -> Option<String> {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Short SHA, suffixed with `-dirty` when the tree has local changes.
fn git_sha() -> String {
    let Some(sha) = command_output("git", &["rev-parse", "--short", "HEAD"]) else {
        return "unknown".into();
    };
    match command_output("git", &["status", "--porcelain", "--untracked-files=no"]) {
        Some(_) => format!("{sha}-dirty"),
        None => sha,
    }
}

/// UTC ISO-8601. Honors `SOURCE_DATE_EPOCH` for reproducible builds.
fn build_timestamp() -> String {
    if let Ok(epoch) = std::env::var("SOURCE_DATE_EPOCH") {
        if let Some(ts) = command_output("date", &["-u", "-d", &format!("@{epoch}"), "+%Y-%m-%dT%H:%M:%SZ"]) {
            return ts;
        }
    }
    command_output("date", &["-u", "+%Y-%m-%dT%H:%M:%SZ"])
        .or_else(|| {
            command_output(
                "powershell",
                &[
                    "-Command",
                    "(Get-Date).ToUniversalTime().ToString('yyyy-MM-ddTHH:mm:ssZ')",
                ],
            )
        })
        .unwrap_or_else(|| "unknown".into())
}
