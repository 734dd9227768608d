use std::sync::LazyLock;

use crate::build_info::BUILD_INFO;

const SHORT_SHA_LEN: usize = 8;

/// `<image version> (<short sha>[, dirty])`, shown by `--version` and the
/// startup log line.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    let sha = BUILD_INFO
        .commit_sha1
        .map(|sha| &sha[..sha.len().min(SHORT_SHA_LEN)])
        .unwrap_or("unknown");
    let dirty = if BUILD_INFO.git_dirty { ", dirty" } else { "" };
    format!("{} ({sha}{dirty})", env!("IMAGE_VERSION"))
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_starts_with_image_version() {
        assert!(
            VERSION.starts_with(env!("IMAGE_VERSION")),
            "version should be prefixed by the image version"
        );
    }

    #[test]
    fn version_carries_a_short_sha() {
        let inner = VERSION
            .split_once('(')
            .and_then(|(_, rest)| rest.strip_suffix(')'))
            .unwrap_or_default();
        let sha = inner.split(',').next().unwrap_or_default();

        assert!(
            !sha.is_empty() && sha.len() <= SHORT_SHA_LEN,
            "sha should be at most {SHORT_SHA_LEN} characters, got {sha:?}"
        );
    }
}
