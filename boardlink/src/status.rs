//! Visual status indicator for a connection node.

use serde::Serialize;

use crate::lifecycle::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Color {
    Red,
    Yellow,
    Green,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Shape {
    Ring,
    Dot,
}

/// Status tuple shown next to a node in the host editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Status {
    pub fill: Color,
    pub shape: Shape,
    pub text: &'static str,
}

impl Status {
    const fn new(fill: Color, shape: Shape, text: &'static str) -> Self {
        Self { fill, shape, text }
    }
}

/// Project a connection state onto its status tuple.
pub fn project(state: ConnectionState) -> Status {
    use ConnectionState::*;
    match state {
        Idle | Connecting => Status::new(Color::Red, Shape::Ring, "connecting"),
        NetworkReady => Status::new(Color::Yellow, Shape::Ring, "connecting..."),
        NetworkError => Status::new(Color::Red, Shape::Dot, "disconnected"),
        IoError => Status::new(Color::Red, Shape::Dot, "error"),
        IoReady => Status::new(Color::Green, Shape::Dot, "connected"),
        Closed => Status::new(Color::Red, Shape::Ring, "closed"),
    }
}

impl From<ConnectionState> for Status {
    fn from(state: ConnectionState) -> Self {
        project(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(ConnectionState::Idle, Color::Red, Shape::Ring, "connecting")]
    #[test_case(ConnectionState::Connecting, Color::Red, Shape::Ring, "connecting")]
    #[test_case(ConnectionState::NetworkReady, Color::Yellow, Shape::Ring, "connecting...")]
    #[test_case(ConnectionState::NetworkError, Color::Red, Shape::Dot, "disconnected")]
    #[test_case(ConnectionState::IoError, Color::Red, Shape::Dot, "error")]
    #[test_case(ConnectionState::IoReady, Color::Green, Shape::Dot, "connected")]
    #[test_case(ConnectionState::Closed, Color::Red, Shape::Ring, "closed")]
    fn projects(state: ConnectionState, fill: Color, shape: Shape, text: &str) {
        let status = project(state);
        assert_eq!((status.fill, status.shape, status.text), (fill, shape, text));
    }

    #[test]
    fn serializes_for_the_editor() {
        let json = serde_json::to_value(project(ConnectionState::NetworkReady)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"fill": "yellow", "shape": "ring", "text": "connecting..."})
        );
    }
}
