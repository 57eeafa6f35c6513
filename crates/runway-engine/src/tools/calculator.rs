//! Built-in calculator server

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{ToolDescriptor, ToolServer, ToolServerError};

pub const SERVER_ID: &str = "calculator_server";
pub const TOOL_NAME: &str = "calculator";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Operation {
    Add,
    Subtract,
    Multiply,
    Divide,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CalculatorInput {
    operation: Operation,
    a: f64,
    b: f64,
}

/// Four-function calculator. Division by zero is an application error the
/// executor surfaces as `tool.server.error`.
pub struct CalculatorServer;

impl CalculatorServer {
    pub fn new() -> Self {
        Self
    }

    fn parse(arguments: &Value) -> Result<CalculatorInput, ToolServerError> {
        serde_json::from_value(arguments.clone())
            .map_err(|e| ToolServerError::InvalidArguments(e.to_string()))
    }
}

impl Default for CalculatorServer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolServer for CalculatorServer {
    fn server_id(&self) -> &str {
        SERVER_ID
    }

    fn descriptors(&self) -> Vec<ToolDescriptor> {
        vec![ToolDescriptor {
            name: TOOL_NAME.to_string(),
            description: "Perform basic arithmetic on two operands.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "operation": {
                        "type": "string",
                        "enum": ["add", "subtract", "multiply", "divide"]
                    },
                    "a": {"type": "number", "description": "First operand"},
                    "b": {"type": "number", "description": "Second operand"}
                },
                "required": ["operation", "a", "b"],
                "additionalProperties": false
            }),
            permission_scope: "calculator.execute".to_string(),
            server_id: SERVER_ID.to_string(),
            source: "builtin".to_string(),
            read_only: true,
        }]
    }

    fn validate(&self, tool_name: &str, arguments: &Value) -> Result<(), ToolServerError> {
        if tool_name != TOOL_NAME {
            return Err(ToolServerError::UnknownTool(tool_name.to_string()));
        }
        Self::parse(arguments).map(|_| ())
    }

    async fn invoke(&self, tool_name: &str, arguments: &Value) -> Result<Value, ToolServerError> {
        if tool_name != TOOL_NAME {
            return Err(ToolServerError::UnknownTool(tool_name.to_string()));
        }
        let input = Self::parse(arguments)?;
        let result = match input.operation {
            Operation::Add => input.a + input.b,
            Operation::Subtract => input.a - input.b,
            Operation::Multiply => input.a * input.b,
            Operation::Divide => {
                if input.b == 0.0 {
                    return Err(ToolServerError::Application(
                        json!({"error": "division_by_zero"}),
                    ));
                }
                input.a / input.b
            }
        };
        Ok(json!({"result": result}))
    }
}
