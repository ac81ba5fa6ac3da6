use std::env;

/// Process-wide settings sourced from the environment at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Namespace holding the request-serving machine sets that back the
    /// machine-size cache.
    pub management_namespace: String,
}

impl Settings {
    pub fn from_env() -> Self {
        Settings {
            management_namespace: env::var("MANAGEMENT_NAMESPACE")
                .unwrap_or_else(|_| "openshift-machine-api".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply_without_env() {
        env::remove_var("MANAGEMENT_NAMESPACE");
        let settings = Settings::from_env();
        assert_eq!(settings.management_namespace, "openshift-machine-api");
    }
}
