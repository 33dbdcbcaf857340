//! Id generation for connections and outgoing request ids.

use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IdFormat {
    /// 32 hex chars, no hyphens.
    #[default]
    Simple,
    Hyphenated,
}

#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    /// Truncate the random part to this many characters.
    pub length: Option<usize>,
    pub format: IdFormat,
}

impl GenerateOptions {
    pub fn prefixed(prefix: &str) -> Self {
        GenerateOptions {
            prefix: Some(prefix.to_owned()),
            ..Self::default()
        }
    }
}

/// Generates strings unique within the engine's lifetime.
pub trait IdGenerator: Send + Sync + 'static {
    fn generate(&self, options: GenerateOptions) -> String;
}

/// UUID v4 backed generator, the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn generate(&self, options: GenerateOptions) -> String {
        let id = Uuid::new_v4();
        let mut body = match options.format {
            IdFormat::Simple => id.simple().to_string(),
            IdFormat::Hyphenated => id.hyphenated().to_string(),
        };
        if let Some(length) = options.length {
            body.truncate(length);
        }
        match (options.prefix, options.suffix) {
            (Some(prefix), Some(suffix)) => format!("{prefix}-{body}-{suffix}"),
            (Some(prefix), None) => format!("{prefix}-{body}"),
            (None, Some(suffix)) => format!("{body}-{suffix}"),
            (None, None) => body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let generator = UuidIdGenerator;
        let a = generator.generate(GenerateOptions::default());
        let b = generator.generate(GenerateOptions::default());
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_prefix_and_length() {
        let generator = UuidIdGenerator;
        let id = generator.generate(GenerateOptions {
            prefix: Some("conn".into()),
            length: Some(8),
            ..GenerateOptions::default()
        });
        assert!(id.starts_with("conn-"));
        assert_eq!(id.len(), "conn-".len() + 8);
    }
}
