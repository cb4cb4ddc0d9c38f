use std::path::PathBuf;

use anyhow::Context;

/// Acquires the Java runtime a server requires.
///
/// Implementations may download a JDK; the agent only needs the returned
/// executable path and tolerates `ensure` being slow.
#[async_trait::async_trait]
pub trait RuntimeResolver: Send + Sync {
    async fn ensure(&self, version_label: &str) -> anyhow::Result<PathBuf>;
}

/// Resolves `java` from PATH and verifies the installed major version
/// against the requested label. Does not download anything.
pub struct SystemRuntime;

#[async_trait::async_trait]
impl RuntimeResolver for SystemRuntime {
    async fn ensure(&self, version_label: &str) -> anyhow::Result<PathBuf> {
        let requested: u32 = version_label
            .trim()
            .parse()
            .with_context(|| format!("invalid java version label: {version_label}"))?;

        let have = detect_java_major().await?;
        if have != requested {
            anyhow::bail!(
                "java major mismatch: need {requested}, runtime on PATH has {have} \
                 (install Java {requested}, Temurin recommended)"
            );
        }
        Ok(PathBuf::from("java"))
    }
}

async fn detect_java_major() -> anyhow::Result<u32> {
    let out = tokio::process::Command::new("java")
        .arg("-version")
        .output()
        .await
        .context("run `java -version`")?;
    // The JVM prints version banners to stderr.
    let text = String::from_utf8_lossy(&out.stderr);
    let first = text.lines().next().unwrap_or_default();

    parse_java_major_from_version_line(first)
}

fn parse_java_major_from_version_line(first_line: &str) -> anyhow::Result<u32> {
    // Typical formats:
    // - openjdk version "21.0.2" 2024-01-16
    // - java version "1.8.0_402"
    // Some builds omit quotes:
    // - openjdk 21.0.2 2024-01-16

    let ver = if let Some(quoted) = first_line.split('"').nth(1) {
        quoted
    } else {
        // Fall back to the first whitespace token that starts with a digit.
        // This intentionally avoids parsing dates like 2024-01-16 because
        // the version token appears earlier.
        first_line
            .split_whitespace()
            .find(|t| t.chars().next().is_some_and(|c| c.is_ascii_digit()))
            .ok_or_else(|| anyhow::anyhow!("failed to parse java version output: {first_line}"))?
    };

    let parse_leading_u32 = |s: &str| -> anyhow::Result<u32> {
        let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        if end == 0 {
            anyhow::bail!("failed to parse java major from: {ver}");
        }
        s[..end]
            .parse::<u32>()
            .map_err(|_| anyhow::anyhow!("failed to parse java major from: {ver}"))
    };

    let major = if ver.starts_with("1.") {
        // Legacy "1.8.x" form.
        let second = ver.split('.').nth(1).unwrap_or("");
        parse_leading_u32(second)?
    } else {
        let first = ver.split('.').next().unwrap_or("");
        parse_leading_u32(first)?
    };

    Ok(major)
}

#[cfg(test)]
mod tests {
    use super::parse_java_major_from_version_line;

    #[test]
    fn parse_java_major_modern_openjdk() {
        let line = "openjdk version \"21.0.2\" 2024-01-16";
        assert_eq!(parse_java_major_from_version_line(line).unwrap(), 21);
    }

    #[test]
    fn parse_java_major_modern_no_quotes() {
        let line = "openjdk 21.0.2 2024-01-16";
        assert_eq!(parse_java_major_from_version_line(line).unwrap(), 21);
    }

    #[test]
    fn parse_java_major_legacy_1_8() {
        let line = "java version \"1.8.0_402\"";
        assert_eq!(parse_java_major_from_version_line(line).unwrap(), 8);
    }

    #[test]
    fn parse_java_major_rejects_garbage() {
        let err = parse_java_major_from_version_line("not java").unwrap_err();
        assert!(err.to_string().contains("failed to parse java version"));
    }
}
