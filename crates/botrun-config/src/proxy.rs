use crate::Parameter;

/// Network proxy the client routes through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Proxy {
    Basic {
        ip_address: String,
        port: u16,
        nickname: String,
    },
    Authenticated {
        ip_address: String,
        port: u16,
        username: String,
        password: String,
        nickname: String,
    },
}

impl Proxy {
    pub fn basic(ip_address: impl Into<String>, port: u16) -> Self {
        Proxy::Basic {
            ip_address: ip_address.into(),
            port,
            nickname: String::new(),
        }
    }

    pub fn authenticated(
        ip_address: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Proxy::Authenticated {
            ip_address: ip_address.into(),
            port,
            username: username.into(),
            password: password.into(),
            nickname: String::new(),
        }
    }

    pub fn with_nickname(mut self, name: impl Into<String>) -> Self {
        match &mut self {
            Proxy::Basic { nickname, .. } | Proxy::Authenticated { nickname, .. } => {
                *nickname = name.into();
            }
        }
        self
    }

    pub fn ip_address(&self) -> &str {
        match self {
            Proxy::Basic { ip_address, .. } | Proxy::Authenticated { ip_address, .. } => ip_address,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Proxy::Basic { port, .. } | Proxy::Authenticated { port, .. } => *port,
        }
    }

    pub fn nickname(&self) -> &str {
        match self {
            Proxy::Basic { nickname, .. } | Proxy::Authenticated { nickname, .. } => nickname,
        }
    }
}

impl Parameter for Proxy {
    fn to_parameter(&self) -> Vec<String> {
        let value = match self {
            Proxy::Basic {
                ip_address, port, ..
            } => format!("{ip_address}:{port}"),
            Proxy::Authenticated {
                ip_address,
                port,
                username,
                password,
                ..
            } => format!("{ip_address}:{port}:{username}:{password}"),
        };
        vec!["-proxy".to_string(), value]
    }
}

impl std::fmt::Display for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Proxy::Basic {
                ip_address,
                port,
                nickname,
            } => {
                if nickname.is_empty() {
                    write!(f, "{ip_address}:{port}")
                } else {
                    write!(f, "{nickname} ({ip_address}:{port})")
                }
            }
            // Never show the password.
            Proxy::Authenticated {
                ip_address,
                port,
                username,
                ..
            } => write!(f, "{ip_address}:{port}:{username}"),
        }
    }
}
