//! Edge identifiers used to address channels, buffers, and drain commands.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::graph::WorkerId;

/// Identifies a directed boundary between two workers, or between a worker
/// and the outside of the stream graph.
///
/// `upstream == None` marks the graph's overall input and
/// `downstream == None` its overall output. Tokens order by upstream then
/// downstream, so the overall input token of a worker sorts before any
/// worker-to-worker edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Token {
    pub upstream: Option<WorkerId>,
    pub downstream: Option<WorkerId>,
}

impl Token {
    /// The edge from `upstream` to `downstream`.
    pub fn edge(upstream: WorkerId, downstream: WorkerId) -> Self {
        Self {
            upstream: Some(upstream),
            downstream: Some(downstream),
        }
    }

    /// The token feeding the graph's input into `worker`.
    pub fn overall_input(worker: WorkerId) -> Self {
        Self {
            upstream: None,
            downstream: Some(worker),
        }
    }

    /// The token carrying `worker`'s output out of the graph.
    pub fn overall_output(worker: WorkerId) -> Self {
        Self {
            upstream: Some(worker),
            downstream: None,
        }
    }

    pub fn is_overall_input(&self) -> bool {
        self.upstream.is_none()
    }

    pub fn is_overall_output(&self) -> bool {
        self.downstream.is_none()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.upstream, self.downstream) {
            (Some(u), Some(d)) => write!(f, "Token({u}, {d})"),
            (None, Some(d)) => write!(f, "Token(input, {d})"),
            (Some(u), None) => write!(f, "Token({u}, output)"),
            (None, None) => write!(f, "Token(input, output)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overall_input_sorts_first() {
        let input = Token::overall_input(WorkerId(5));
        let edge = Token::edge(WorkerId(0), WorkerId(1));
        assert!(input < edge);
        assert!(input.is_overall_input());
        assert!(!edge.is_overall_output());
    }

    #[test]
    fn display_names_endpoints() {
        assert_eq!(Token::edge(WorkerId(1), WorkerId(2)).to_string(), "Token(1, 2)");
        assert_eq!(Token::overall_output(WorkerId(7)).to_string(), "Token(7, output)");
    }
}
