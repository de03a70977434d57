use crate::Parameter;

/// A script the client runs after login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub identifier: String,
    pub parameters: String,
    /// Local scripts are referenced by file name and need the identifier quoted too.
    pub is_local: bool,
    pub nickname: String,
}

impl Script {
    pub fn new(identifier: impl Into<String>, parameters: impl Into<String>, is_local: bool) -> Self {
        Self {
            identifier: identifier.into(),
            parameters: parameters.into(),
            is_local,
            nickname: String::new(),
        }
    }
}

impl Parameter for Script {
    fn to_parameter(&self) -> Vec<String> {
        let value = if self.is_local {
            format!(r#"\"{}\":\"{}\""#, self.identifier, self.parameters)
        } else {
            format!(r#"{}:\"{}\""#, self.identifier, self.parameters)
        };
        vec!["-script".to_string(), value]
    }
}

impl std::fmt::Display for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.nickname, self.identifier)
    }
}
