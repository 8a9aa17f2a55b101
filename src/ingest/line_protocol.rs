// =============================================================================
// Producer Line Protocol — command parser and session state machine
// =============================================================================
//
// External producers write newline-terminated commands on stdout:
//
//   CHART type.id name title units family category chart priority update_every
//   DIMENSION id name algorithm multiplier divisor [hidden]
//   BEGIN type.id [microseconds]
//   SET id = value
//   END
//   FLUSH
//   DISABLE
//
// Fields are whitespace-separated and may be quoted with " or '. The
// session is a two-state machine: Idle (no current chart) and InChart.
// Transitions are exactly the table above; any out-of-order command is a
// typed protocol error and the supervisor disables the producer. Guessing
// intent is a bug surface this parser deliberately refuses to have.
// =============================================================================

use std::sync::Arc;

use tracing::{debug, warn};

use crate::rrd::registry::{ChartRegistry, ChartSpec};
use crate::types::{Algorithm, ChartType};

// =============================================================================
// Errors
// =============================================================================

/// A producer protocol fault. Every variant disables the producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// SET / END / DIMENSION arrived with no chart selected.
    NoCurrentChart { command: &'static str },
    /// BEGIN named a chart that was never declared.
    UnknownChart { id: String },
    /// A command was missing a required argument.
    MissingArgument { command: &'static str },
    /// The command keyword is not part of the protocol.
    UnknownCommand { command: String },
    /// The producer asked to be disabled.
    Disabled,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoCurrentChart { command } => {
                write!(f, "{command} without a BEGIN/CHART selecting a chart")
            }
            Self::UnknownChart { id } => write!(f, "BEGIN on unknown chart '{id}'"),
            Self::MissingArgument { command } => {
                write!(f, "{command} is missing a required argument")
            }
            Self::UnknownCommand { command } => write!(f, "unknown command '{command}'"),
            Self::Disabled => write!(f, "producer requested DISABLE"),
        }
    }
}

impl std::error::Error for ProtocolError {}

// =============================================================================
// Tokenizer
// =============================================================================

/// Split a command line into fields: whitespace-separated, with `"` and
/// `'` quoting; backslash escapes the next character inside double quotes.
pub fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_field = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                if c == '\\' && q == '"' {
                    if let Some(escaped) = chars.next() {
                        current.push(escaped);
                    }
                } else if c == q {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            None => {
                if c == '"' || c == '\'' {
                    quote = Some(c);
                    in_field = true;
                } else if c.is_whitespace() {
                    if in_field {
                        fields.push(std::mem::take(&mut current));
                        in_field = false;
                    }
                } else {
                    current.push(c);
                    in_field = true;
                }
            }
        }
    }
    if in_field {
        fields.push(current);
    }
    fields
}

// =============================================================================
// Session
// =============================================================================

/// One producer's protocol session. Owns the "current chart" cursor and
/// executes commands against the registry.
pub struct ProducerSession {
    registry: Arc<ChartRegistry>,
    producer: String,
    default_update_every: u32,
    current: Option<Arc<crate::rrd::Chart>>,
    useful_commands: u64,
}

impl ProducerSession {
    pub fn new(registry: Arc<ChartRegistry>, producer: &str, default_update_every: u32) -> Self {
        Self {
            registry,
            producer: producer.to_string(),
            default_update_every: default_update_every.max(1),
            current: None,
            useful_commands: 0,
        }
    }

    /// True once the producer has issued at least one successful
    /// chart-level command; producers that never do are not respawned.
    pub fn useful(&self) -> bool {
        self.useful_commands > 0
    }

    /// Execute one protocol line. An `Err` is a protocol fault: the caller
    /// disables the producer and terminates it.
    pub fn handle_line(&mut self, line: &str) -> Result<(), ProtocolError> {
        let fields = split_fields(line);
        let Some(command) = fields.first().map(String::as_str) else {
            return Ok(()); // blank line
        };

        match command {
            "SET" => self.cmd_set(&fields),
            "BEGIN" => self.cmd_begin(&fields),
            "END" => self.cmd_end(),
            "FLUSH" => {
                self.current = None;
                Ok(())
            }
            "CHART" => self.cmd_chart(&fields),
            "DIMENSION" => self.cmd_dimension(&fields),
            "DISABLE" => Err(ProtocolError::Disabled),
            other => Err(ProtocolError::UnknownCommand {
                command: other.to_string(),
            }),
        }
    }

    fn cmd_chart(&mut self, fields: &[String]) -> Result<(), ProtocolError> {
        self.current = None;

        let full = fields
            .get(1)
            .filter(|s| !s.is_empty())
            .ok_or(ProtocolError::MissingArgument { command: "CHART" })?;
        let (type_name, id) = full
            .split_once('.')
            .filter(|(t, i)| !t.is_empty() && !i.is_empty())
            .ok_or(ProtocolError::MissingArgument { command: "CHART" })?;

        let arg = |i: usize| fields.get(i).filter(|s| !s.is_empty()).cloned();

        let priority = arg(8).and_then(|s| s.parse().ok()).unwrap_or(1000);
        let update_every = arg(9)
            .and_then(|s| s.parse().ok())
            .filter(|&u| u > 0)
            .unwrap_or(self.default_update_every);
        let chart_type = arg(7)
            .map(|s| ChartType::from_name(&s))
            .unwrap_or_default();

        let chart = self.registry.create_or_get(ChartSpec {
            type_name: type_name.to_string(),
            id: id.to_string(),
            name: arg(2),
            title: arg(3),
            units: arg(4),
            family: arg(5),
            context: arg(6).filter(|c| c != "none"),
            priority,
            update_every,
            chart_type,
        });

        debug!(producer = %self.producer, chart = %chart.id, "selected chart");
        self.useful_commands += 1;
        self.current = Some(chart);
        Ok(())
    }

    fn cmd_dimension(&mut self, fields: &[String]) -> Result<(), ProtocolError> {
        let chart = self
            .current
            .as_ref()
            .ok_or(ProtocolError::NoCurrentChart {
                command: "DIMENSION",
            })?;

        let id = fields
            .get(1)
            .filter(|s| !s.is_empty())
            .ok_or(ProtocolError::MissingArgument {
                command: "DIMENSION",
            })?;

        let arg = |i: usize| fields.get(i).filter(|s| !s.is_empty());

        let name = arg(2).map(String::as_str).unwrap_or(id);
        let algorithm = arg(3)
            .map(|s| Algorithm::from_name(s))
            .unwrap_or(Algorithm::Absolute);
        let multiplier = arg(4).and_then(|s| s.parse().ok()).unwrap_or(1);
        let divisor = arg(5).and_then(|s| s.parse().ok()).unwrap_or(1);
        let hidden = arg(6).map(|s| s == "hidden").unwrap_or(false);

        chart.find_or_add_dimension(id, name, algorithm, multiplier, divisor, hidden);
        self.useful_commands += 1;
        Ok(())
    }

    fn cmd_begin(&mut self, fields: &[String]) -> Result<(), ProtocolError> {
        let id = fields
            .get(1)
            .filter(|s| !s.is_empty())
            .ok_or(ProtocolError::MissingArgument { command: "BEGIN" })?;

        let chart = self
            .registry
            .find_by_id(id)
            .ok_or_else(|| ProtocolError::UnknownChart { id: id.clone() })?;

        // Until the chart has completed one cycle there is no meaningful
        // elapsed time to announce.
        if chart.counter_done() > 0 {
            let microseconds: u64 = fields
                .get(2)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            if microseconds > 0 {
                chart.next_usec(microseconds);
            } else {
                chart.next();
            }
        }

        self.current = Some(chart);
        Ok(())
    }

    fn cmd_set(&mut self, fields: &[String]) -> Result<(), ProtocolError> {
        let chart = self
            .current
            .as_ref()
            .ok_or(ProtocolError::NoCurrentChart { command: "SET" })?;

        // Accept both `SET id = value` and `SET id=value`.
        let rest = fields[1..].join(" ").replace('=', " ");
        let parts = split_fields(&rest);

        let (Some(dimension), Some(value)) = (parts.first(), parts.get(1)) else {
            return Err(ProtocolError::MissingArgument { command: "SET" });
        };

        let value: i64 = value.parse().unwrap_or(0);
        if !chart.set(dimension, value) {
            warn!(
                producer = %self.producer,
                chart = %chart.id,
                dimension = %dimension,
                "SET on unknown dimension"
            );
        }
        self.useful_commands += 1;
        Ok(())
    }

    fn cmd_end(&mut self) -> Result<(), ProtocolError> {
        let chart = self
            .current
            .take()
            .ok_or(ProtocolError::NoCurrentChart { command: "END" })?;
        chart.done();
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
