pub type FramesmithResult<T> = Result<T, FramesmithError>;

#[derive(thiserror::Error, Debug)]
pub enum FramesmithError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("build error: {0}")]
    Build(String),

    #[error("render error: {0}")]
    Render(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FramesmithError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn build(msg: impl Into<String>) -> Self {
        Self::Build(msg.into())
    }

    pub fn render(msg: impl Into<String>) -> Self {
        Self::Render(msg.into())
    }

    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode(msg.into())
    }

    /// Whether the error was caused by caller input rather than by the system.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefixes_are_stable() {
        assert!(
            FramesmithError::validation("x")
                .to_string()
                .contains("validation error:")
        );
        assert!(FramesmithError::build("x").to_string().contains("build error:"));
        assert!(
            FramesmithError::render("x")
                .to_string()
                .contains("render error:")
        );
        assert!(
            FramesmithError::encode("x")
                .to_string()
                .contains("encode error:")
        );
    }

    #[test]
    fn other_preserves_source() {
        let base = std::io::Error::other("boom");
        let err = FramesmithError::Other(anyhow::Error::new(base));
        assert!(err.to_string().contains("boom"));
        assert!(!err.is_validation());
    }

    #[test]
    fn panic_message_reads_str_and_string_payloads() {
        let caught = std::panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "static");
        let caught = std::panic::catch_unwind(|| panic!("{}", 42)).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "42");
    }
}
