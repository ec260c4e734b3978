use serde::{Deserialize, Serialize};
use std::fmt;

/// A row or column label.
///
/// Labels carry a total order (all integer labels sort before all string
/// labels) so that sorted unions produced by alignment are deterministic
/// across repeated invocations.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Label {
    Int(i64),
    Str(String),
}

impl Label {
    /// Positional labels `0..n`, used when an operator drops the incoming
    /// labels and the result falls back to a plain range.
    pub fn range(n: usize) -> Vec<Label> {
        (0..n as i64).map(Label::Int).collect()
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Int(v) => write!(f, "{v}"),
            Label::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for Label {
    fn from(v: i64) -> Self {
        Label::Int(v)
    }
}

impl From<&str> for Label {
    fn from(s: &str) -> Self {
        Label::Str(s.to_string())
    }
}

impl From<String> for Label {
    fn from(s: String) -> Self {
        Label::Str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_labels_sort_before_strings() {
        let mut labels = vec![
            Label::from("b"),
            Label::from(10),
            Label::from("a"),
            Label::from(-3),
        ];
        labels.sort();
        assert_eq!(
            labels,
            vec![
                Label::from(-3),
                Label::from(10),
                Label::from("a"),
                Label::from("b"),
            ]
        );
    }

    #[test]
    fn range_is_positional() {
        assert_eq!(
            Label::range(3),
            vec![Label::Int(0), Label::Int(1), Label::Int(2)]
        );
    }
}
