//! A tiny line-oriented interpreter that speaks the worker protocol.
//!
//! It stands in for the real Python worker in tests and local smoke runs. One
//! statement per line:
//!
//! ```text
//! print "label" 42          # print the JSON values, space-separated
//! call echo ["x"]           # call a host function: positional args, then optional kwargs object
//! try call read {"path": "a"}  # same, but an exception becomes {"error": message}
//! return {"done": true}     # finish with this value
//! raise boom                # fail with a runtime error
//! ```
//!
//! Without `return`, the script's output is the value of its last call.
//! Snapshots are the serialized position in the script.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::convert::print_line;
use crate::protocol::{Progress, ResumeRequest, ResumeValue, StartRequest, WorkerError};
use crate::worker::Interpreter;
use daycare_core::Snapshot;

#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptedInterpreter;

impl ScriptedInterpreter {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Statement {
    Print(Vec<Value>),
    Call {
        name: String,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        catch: bool,
    },
    Return(Value),
    Raise(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct State {
    code: String,
    /// Index of the statement the script is paused on.
    pc: usize,
    last: Value,
}

impl Interpreter for ScriptedInterpreter {
    fn start(&self, request: StartRequest) -> Result<Progress, WorkerError> {
        parse(&request.code)?;
        run(State {
            code: request.code,
            pc: 0,
            last: Value::Null,
        })
    }

    fn resume(&self, request: ResumeRequest) -> Result<Progress, WorkerError> {
        let mut state: State = serde_json::from_slice(request.snapshot.as_bytes())
            .map_err(|e| WorkerError::internal(format!("unreadable snapshot: {e}")))?;
        let statements = parse(&state.code)?;
        let Some(Statement::Call { catch, .. }) = statements.get(state.pc) else {
            return Err(WorkerError::internal("snapshot does not point at a call"));
        };

        state.last = match request.value {
            ResumeValue::Return { value } => value,
            ResumeValue::Exception { message, .. } if *catch => json!({ "error": message }),
            ResumeValue::Exception { kind, message } => {
                return Err(WorkerError::runtime(format!("{kind}: {message}")));
            }
        };
        state.pc += 1;
        run(state)
    }
}

fn run(mut state: State) -> Result<Progress, WorkerError> {
    let statements = parse(&state.code)?;
    let mut printed = Vec::new();
    while let Some(statement) = statements.get(state.pc) {
        match statement {
            Statement::Print(values) => printed.push(print_line(values)),
            Statement::Call {
                name, args, kwargs, ..
            } => {
                let snapshot = serde_json::to_vec(&state)
                    .map_err(|e| WorkerError::internal(format!("snapshot failed: {e}")))?;
                return Ok(Progress::Suspended {
                    snapshot: Snapshot::new(snapshot),
                    function_name: name.clone(),
                    args: args.clone(),
                    kwargs: kwargs.clone(),
                    printed,
                });
            }
            Statement::Return(value) => {
                return Ok(Progress::Complete {
                    output: value.clone(),
                    printed,
                });
            }
            Statement::Raise(message) => return Err(WorkerError::runtime(message.clone())),
        }
        state.pc += 1;
    }
    Ok(Progress::Complete {
        output: state.last,
        printed,
    })
}

fn parse(code: &str) -> Result<Vec<Statement>, WorkerError> {
    let mut statements = Vec::new();
    for (index, raw) in code.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let statement = parse_statement(line)
            .map_err(|e| WorkerError::syntax(format!("line {}: {e}", index + 1)))?;
        statements.push(statement);
    }
    Ok(statements)
}

fn parse_statement(line: &str) -> Result<Statement, String> {
    let (word, rest) = split_word(line);
    match word {
        "print" => Ok(Statement::Print(json_values(rest)?)),
        "return" => {
            let mut values = json_values(rest)?;
            match values.len() {
                0 => Ok(Statement::Return(Value::Null)),
                1 => Ok(Statement::Return(values.remove(0))),
                _ => Err("return takes one value".into()),
            }
        }
        "raise" => Ok(Statement::Raise(rest.to_string())),
        "call" => parse_call(rest, false),
        "try" => match split_word(rest) {
            ("call", call) => parse_call(call, true),
            _ => Err("expected `try call`".into()),
        },
        other => Err(format!("unknown statement `{other}`")),
    }
}

fn parse_call(rest: &str, catch: bool) -> Result<Statement, String> {
    let (name, rest) = split_word(rest);
    if name.is_empty() {
        return Err("call needs a function name".into());
    }
    let mut values = json_values(rest)?.into_iter();
    let args = match values.next() {
        None => vec![],
        Some(Value::Array(items)) => items,
        Some(_) => return Err("call arguments must be a JSON array".into()),
    };
    let kwargs = match values.next() {
        None => Map::new(),
        Some(Value::Object(map)) => map,
        Some(_) => return Err("call keyword arguments must be a JSON object".into()),
    };
    if values.next().is_some() {
        return Err("too many values after call".into());
    }
    Ok(Statement::Call {
        name: name.to_string(),
        args,
        kwargs,
        catch,
    })
}

fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], s[i..].trim_start()),
        None => (s, ""),
    }
}

fn json_values(s: &str) -> Result<Vec<Value>, String> {
    serde_json::Deserializer::from_str(s)
        .into_iter::<Value>()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid value: {e}"))
}
