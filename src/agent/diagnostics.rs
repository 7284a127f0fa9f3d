use std::process::Stdio;

use tokio::process::Command;

/// Environmental probe attached to classified failures.
///
/// Strictly descriptive: the classifier must never branch on anything
/// collected here. The output lands in the detailed log so an operator can
/// see, next to the failure, whether the binary exists, what version
/// answered, and which PATH entries were in play.
pub async fn collect_environment(binary_hint: &str) -> Vec<String> {
    let mut context = Vec::new();

    match Command::new("which")
        .arg(binary_hint)
        .stderr(Stdio::null())
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            let location = String::from_utf8_lossy(&output.stdout).trim().to_string();
            context.push(format!("agent binary: {location}"));
        }
        _ => context.push(format!("agent binary: {binary_hint} not found on PATH")),
    }

    match Command::new(binary_hint)
        .arg("--version")
        .stderr(Stdio::null())
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout)
                .lines()
                .next()
                .unwrap_or("")
                .to_string();
            context.push(format!("agent version: {version}"));
        }
        Ok(output) => context.push(format!(
            "agent version probe exited with {:?}",
            output.status.code()
        )),
        Err(e) => context.push(format!("agent version probe failed: {e}")),
    }

    if let Ok(path) = std::env::var("PATH") {
        let interesting: Vec<&str> = path
            .split(':')
            .filter(|entry| entry.contains("local") || entry.contains("bin"))
            .take(8)
            .collect();
        context.push(format!("path entries: {}", interesting.join(":")));
    }

    context
}
