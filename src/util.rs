use sha2::Digest;
use std::path::{Path, PathBuf};

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn truncate_string(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut truncated = String::new();
    for ch in text.chars() {
        if truncated.len() + ch.len_utf8() > max_bytes {
            break;
        }
        truncated.push(ch);
    }
    truncated
}

/// Normalize a session name into a safe directory name under the env root.
/// Non-word characters collapse to `-`; a name that would push the full path
/// past a portable length is replaced with a digest prefix.
pub fn normalize_env_dir(envdir: &Path, name: &str) -> PathBuf {
    let mut cleaned = String::with_capacity(name.len());
    let mut last_dash = false;
    for ch in name.chars() {
        let keep = ch.is_alphanumeric() || ch == '_';
        if keep {
            for lower in ch.to_lowercase() {
                cleaned.push(lower);
            }
            last_dash = false;
        } else if !last_dash && !cleaned.is_empty() {
            cleaned.push('-');
            last_dash = true;
        }
    }
    let cleaned = cleaned.trim_matches('-').to_string();

    let full = envdir.join(&cleaned);
    // Leave headroom for "bin/pythonX.Y" inside the environment.
    if full.as_os_str().len() > 100 - "bin/pythonX.Y".len() {
        let hashed = &sha256_hex(cleaned.as_bytes())[..8];
        tracing::warn!("the environment name was hashed to avoid being too long");
        return envdir.join(hashed);
    }
    full
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_parametric_names() {
        let path = normalize_env_dir(Path::new(".tasklab"), "tests-3.12(django='2.0')");
        assert_eq!(path, Path::new(".tasklab").join("tests-3-12-django-2-0"));
    }

    #[test]
    fn over_long_names_hash_to_a_digest_prefix() {
        let name = "x".repeat(200);
        let path = normalize_env_dir(Path::new(".tasklab"), &name);
        let file = path.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(file.len(), 8);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_string("héllo", 2), "h");
        assert_eq!(truncate_string("ok", 10), "ok");
    }
}
