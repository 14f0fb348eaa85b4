use crate::error::EngineError;

pub const DEFAULT_UNDO_DEPTH: usize = 100;

/// Settings for an [`UndoRedoManager`](crate::UndoRedoManager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoConfig {
    /// Units kept per stack; the oldest is evicted past this.
    pub max_depth: usize,
    /// Objects of these types are neither subscribed nor walked into.
    pub excluded_types: Vec<String>,
}

impl Default for UndoConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_UNDO_DEPTH,
            excluded_types: Vec::new(),
        }
    }
}

impl UndoConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn exclude_type(mut self, type_name: &str) -> Self {
        if !self.excluded_types.iter().any(|t| t == type_name) {
            self.excluded_types.push(type_name.to_string());
        }
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_depth == 0 {
            return Err(EngineError::InvalidConfig(
                "max_depth must be at least 1".into(),
            ));
        }
        if let Some(blank) = self.excluded_types.iter().find(|t| t.trim().is_empty()) {
            return Err(EngineError::InvalidConfig(format!(
                "excluded type name {blank:?} is blank"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = UndoConfig::default();
        assert_eq!(config.max_depth, DEFAULT_UNDO_DEPTH);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_depth_is_rejected() {
        let err = UndoConfig::new().with_max_depth(0).validate().unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[test]
    fn excluded_types_are_deduplicated() {
        let config = UndoConfig::new().exclude_type("Cache").exclude_type("Cache");
        assert_eq!(config.excluded_types, vec!["Cache".to_string()]);
        assert!(UndoConfig::new().exclude_type(" ").validate().is_err());
    }
}
