//! In-memory representation of one packet-filter rule
//!
//! A [`CompleteRule`] renders to the exact argument order the filter tool
//! expects after `-t <table> -<op> <chain> [<index>]`: the `-j` target and its
//! options first, then base matches, then extended matches.

use std::fmt;
use std::net::Ipv4Addr;

/// Rule target
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Action {
    /// ACCEPT
    Accept,
    /// DROP
    Drop,
    /// RETURN to the calling chain
    Return,
    /// MARK --set-mark
    Mark { mark: u32 },
    /// TPROXY to a local listener
    Tproxy {
        on_ip: Option<Ipv4Addr>,
        on_port: u16,
        mark: u32,
    },
    /// REDIRECT --to-ports
    Redirect { to_port: u16 },
    /// Jump to a custom chain
    Jump(String),
}

impl Action {
    /// Target token passed after `-j`
    #[must_use]
    pub fn token(&self) -> &str {
        match self {
            Self::Accept => "ACCEPT",
            Self::Drop => "DROP",
            Self::Return => "RETURN",
            Self::Mark { .. } => "MARK",
            Self::Tproxy { .. } => "TPROXY",
            Self::Redirect { .. } => "REDIRECT",
            Self::Jump(chain) => chain.as_str(),
        }
    }

    /// Chain this action jumps to, if any
    #[must_use]
    pub fn jump_target(&self) -> Option<&str> {
        match self {
            Self::Jump(chain) => Some(chain.as_str()),
            _ => None,
        }
    }

    fn push_args(&self, out: &mut Vec<String>) {
        out.push("-j".into());
        out.push(self.token().into());
        match self {
            Self::Mark { mark } => {
                out.push("--set-mark".into());
                out.push(mark.to_string());
            }
            Self::Tproxy {
                on_ip,
                on_port,
                mark,
            } => {
                if let Some(ip) = on_ip {
                    out.push("--on-ip".into());
                    out.push(ip.to_string());
                }
                out.push("--on-port".into());
                out.push(on_port.to_string());
                out.push("--tproxy-mark".into());
                out.push(mark.to_string());
            }
            Self::Redirect { to_port } => {
                out.push("--to-ports".into());
                out.push(to_port.to_string());
            }
            Self::Accept | Self::Drop | Self::Return | Self::Jump(_) => {}
        }
    }
}

/// `[!] -<flag> <param>`, e.g. `-p tcp` or `! -d 10.0.0.0/8`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BaseMatch {
    pub flag: String,
    pub param: String,
    pub negate: bool,
}

impl BaseMatch {
    pub fn new(flag: impl Into<String>, param: impl Into<String>) -> Self {
        Self {
            flag: flag.into(),
            param: param.into(),
            negate: false,
        }
    }

    #[must_use]
    pub fn negated(mut self) -> Self {
        self.negate = true;
        self
    }

    fn push_args(&self, out: &mut Vec<String>) {
        if self.negate {
            out.push("!".into());
        }
        out.push(format!("-{}", self.flag));
        out.push(self.param.clone());
    }
}

/// `-m <module> [!] --<flag> <param>`, e.g. `-m cgroup --path App.slice`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExtendMatch {
    pub module: String,
    pub flag: String,
    pub param: String,
    pub negate: bool,
}

impl ExtendMatch {
    pub fn new(
        module: impl Into<String>,
        flag: impl Into<String>,
        param: impl Into<String>,
    ) -> Self {
        Self {
            module: module.into(),
            flag: flag.into(),
            param: param.into(),
            negate: false,
        }
    }

    #[must_use]
    pub fn negated(mut self) -> Self {
        self.negate = true;
        self
    }

    fn push_args(&self, out: &mut Vec<String>) {
        out.push("-m".into());
        out.push(self.module.clone());
        if self.negate {
            out.push("!".into());
        }
        out.push(format!("--{}", self.flag));
        out.push(self.param.clone());
    }
}

/// One rule: target plus ordered matches
///
/// Identity is structural. Two rules with equal fields are the same rule for
/// dedup and removal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompleteRule {
    pub action: Action,
    pub base: Vec<BaseMatch>,
    pub extended: Vec<ExtendMatch>,
}

impl CompleteRule {
    /// Rule with no matches
    #[must_use]
    pub const fn new(action: Action) -> Self {
        Self {
            action,
            base: Vec::new(),
            extended: Vec::new(),
        }
    }

    /// Unconditional jump to `chain`
    pub fn jump(chain: impl Into<String>) -> Self {
        Self::new(Action::Jump(chain.into()))
    }

    /// Append a base match
    #[must_use]
    pub fn base(mut self, flag: impl Into<String>, param: impl Into<String>) -> Self {
        self.base.push(BaseMatch::new(flag, param));
        self
    }

    /// Append a negated base match
    #[must_use]
    pub fn not_base(mut self, flag: impl Into<String>, param: impl Into<String>) -> Self {
        self.base.push(BaseMatch::new(flag, param).negated());
        self
    }

    /// Append an extended match
    #[must_use]
    pub fn extend(
        mut self,
        module: impl Into<String>,
        flag: impl Into<String>,
        param: impl Into<String>,
    ) -> Self {
        self.extended.push(ExtendMatch::new(module, flag, param));
        self
    }

    /// Append a negated extended match
    #[must_use]
    pub fn not_extend(
        mut self,
        module: impl Into<String>,
        flag: impl Into<String>,
        param: impl Into<String>,
    ) -> Self {
        self.extended
            .push(ExtendMatch::new(module, flag, param).negated());
        self
    }

    /// Rule arguments in filter-tool order
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(2 + self.base.len() * 2 + self.extended.len() * 4);
        self.action.push_args(&mut out);
        for m in &self.base {
            m.push_args(&mut out);
        }
        for m in &self.extended {
            m.push_args(&mut out);
        }
        out
    }
}

impl fmt::Display for CompleteRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.args().join(" "))
    }
}
