//! R-style model formulas: `~ 1 + condition + batch`, `~ 0 + group`, `~ a:b`.

use crate::error::DeError;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    Main(String),
    Interaction(Vec<String>),
}

impl Term {
    pub fn variables(&self) -> Vec<&str> {
        match self {
            Term::Main(v) => vec![v.as_str()],
            Term::Interaction(vs) => vs.iter().map(|v| v.as_str()).collect(),
        }
    }

    pub fn name(&self) -> String {
        match self {
            Term::Main(v) => v.clone(),
            Term::Interaction(vs) => vs.join(":"),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Formula {
    pub intercept: bool,
    pub terms: Vec<Term>,
}

impl Formula {
    pub fn parse(formula: &str) -> anyhow::Result<Self> {
        let formula = formula.trim();
        let rhs = formula
            .strip_prefix('~')
            .ok_or_else(|| DeError::FormulaParse(format!("formula '{}' must start with '~'", formula)))?
            .trim();
        if rhs.is_empty() {
            return Err(DeError::FormulaParse("formula right-hand side is empty".into()).into());
        }

        let mut intercept = true;
        let mut terms: Vec<Term> = Vec::new();
        for raw in rhs.split('+') {
            let token = raw.trim();
            match token {
                "" => {
                    return Err(DeError::FormulaParse(format!("empty term in '{}'", formula)).into());
                }
                "1" => intercept = true,
                "0" | "-1" => intercept = false,
                _ => {
                    let parts: Vec<String> = token.split(':').map(|p| p.trim().to_string()).collect();
                    for p in &parts {
                        if p.is_empty() || !p.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.') {
                            return Err(DeError::FormulaParse(format!(
                                "invalid variable name '{}' in '{}'",
                                p, formula
                            ))
                            .into());
                        }
                    }
                    let term = if parts.len() == 1 {
                        Term::Main(parts[0].clone())
                    } else {
                        Term::Interaction(parts)
                    };
                    if !terms.contains(&term) {
                        terms.push(term);
                    }
                }
            }
        }

        if !intercept && terms.is_empty() {
            return Err(DeError::FormulaParse("formula has no terms".into()).into());
        }

        Ok(Formula { intercept, terms })
    }

    pub fn variables(&self) -> Vec<&str> {
        let mut vars: Vec<&str> = Vec::new();
        for term in &self.terms {
            for v in term.variables() {
                if !vars.contains(&v) {
                    vars.push(v);
                }
            }
        }
        vars
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = vec![if self.intercept { "1".to_string() } else { "0".to_string() }];
        parts.extend(self.terms.iter().map(|t| t.name()));
        write!(f, "~ {}", parts.join(" + "))
    }
}

impl std::str::FromStr for Formula {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Formula::parse(s)
    }
}
