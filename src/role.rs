use std::fmt;
use std::str::FromStr;

/// Which component of the target application this daemon profiles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentRole {
    Scheduler,
    Worker,
    Webserver,
    /// A role name we have no process signature for. Never matches.
    Unrecognized(String),
}

/// How a role's process is recognized in a process listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signature {
    /// The command line contains this exact text.
    Static(&'static str),
    /// Pooled processes with no single deterministic match.
    Active,
    /// No known invocation for this role.
    Unknown,
}

impl ComponentRole {
    pub fn name(&self) -> &str {
        match self {
            ComponentRole::Scheduler => "scheduler",
            ComponentRole::Worker => "worker",
            ComponentRole::Webserver => "webserver",
            ComponentRole::Unrecognized(name) => name,
        }
    }

    pub fn signature(&self) -> Signature {
        match self {
            ComponentRole::Scheduler => {
                Signature::Static("/usr/local/airflow/.local/bin/airflow scheduler")
            }
            ComponentRole::Worker => Signature::Active,
            ComponentRole::Webserver => Signature::Static("airflow webserver"),
            ComponentRole::Unrecognized(_) => Signature::Unknown,
        }
    }
}

impl FromStr for ComponentRole {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "scheduler" => ComponentRole::Scheduler,
            "worker" => ComponentRole::Worker,
            "webserver" | "web-server" => ComponentRole::Webserver,
            _ => ComponentRole::Unrecognized(s.trim().to_string()),
        })
    }
}

impl fmt::Display for ComponentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_roles() {
        assert_eq!("scheduler".parse::<ComponentRole>().unwrap(), ComponentRole::Scheduler);
        assert_eq!("Worker".parse::<ComponentRole>().unwrap(), ComponentRole::Worker);
        assert_eq!("webserver".parse::<ComponentRole>().unwrap(), ComponentRole::Webserver);
        assert_eq!("web-server".parse::<ComponentRole>().unwrap(), ComponentRole::Webserver);
    }

    #[test]
    fn test_unrecognized_role_keeps_name() {
        let role: ComponentRole = "triggerer".parse().unwrap();
        assert_eq!(role, ComponentRole::Unrecognized("triggerer".to_string()));
        assert_eq!(role.name(), "triggerer");
        assert_eq!(role.signature(), Signature::Unknown);
    }

    #[test]
    fn test_signatures() {
        assert!(matches!(ComponentRole::Scheduler.signature(), Signature::Static(s) if s.ends_with("airflow scheduler")));
        assert_eq!(ComponentRole::Webserver.signature(), Signature::Static("airflow webserver"));
        assert_eq!(ComponentRole::Worker.signature(), Signature::Active);
    }

    #[test]
    fn test_display_uses_canonical_name() {
        let role: ComponentRole = "web-server".parse().unwrap();
        assert_eq!(role.to_string(), "webserver");
    }
}
