use crate::Parameter;

/// Game account the client logs in with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub username: String,
    pub password: String,
    pub pin: Option<u16>,
}

impl Account {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            pin: None,
        }
    }
}

impl Parameter for Account {
    fn to_parameter(&self) -> Vec<String> {
        let value = match self.pin {
            Some(pin) => format!("{}:{}:{:04}", self.username, self.password, pin),
            None => format!("{}:{}", self.username, self.password),
        };
        vec!["-bot".to_string(), value]
    }
}

impl std::fmt::Display for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.username)
    }
}
