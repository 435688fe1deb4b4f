//! Agent-mode function calling
//!
//! Tool definitions registered with Session A in Full-Agent mode, and the
//! executor that records their effects on the Call. The upstream streams
//! function-call arguments; once complete, `execute` runs the function and
//! the JSON result goes back through `send_function_call_output`.

use serde_json::{json, Value};
use tracing::info;

use crate::types::{Call, CallMode};

/// Tool definitions in the upstream `session.update` format.
pub fn agent_tools() -> Vec<Value> {
    vec![
        json!({
            "type": "function",
            "name": "confirm_reservation",
            "description": "Record reservation confirmation details once the recipient confirms a booking.",
            "parameters": {
                "type": "object",
                "properties": {
                    "reservation_id": {"type": "string", "description": "Reservation number"},
                    "date": {"type": "string", "description": "Reservation date (YYYY-MM-DD)"},
                    "time": {"type": "string", "description": "Reservation time (HH:MM)"},
                    "name": {"type": "string", "description": "Name on the reservation"},
                    "details": {"type": "string", "description": "Additional details"},
                    "status": {
                        "type": "string",
                        "enum": ["confirmed", "modified", "cancelled", "pending"],
                        "description": "Reservation status"
                    },
                },
                "required": ["status"],
            },
        }),
        json!({
            "type": "function",
            "name": "search_location",
            "description": "Record place/business information the recipient provides.",
            "parameters": {
                "type": "object",
                "properties": {
                    "place_name": {"type": "string", "description": "Place or business name"},
                    "address": {"type": "string", "description": "Address"},
                    "phone": {"type": "string", "description": "Phone number"},
                    "hours": {"type": "string", "description": "Business hours"},
                    "notes": {"type": "string", "description": "Other details"},
                },
                "required": ["place_name"],
            },
        }),
        json!({
            "type": "function",
            "name": "collect_info",
            "description": "Record a piece of information gathered during the call.",
            "parameters": {
                "type": "object",
                "properties": {
                    "info_type": {
                        "type": "string",
                        "enum": ["name", "phone", "address", "email", "price", "schedule", "other"],
                        "description": "Kind of information"
                    },
                    "value": {"type": "string", "description": "Collected value"},
                    "context": {"type": "string", "description": "Context of collection"},
                },
                "required": ["info_type", "value"],
            },
        }),
        json!({
            "type": "function",
            "name": "end_call_judgment",
            "description": "Judge whether the call achieved its purpose, when the conversation wraps up naturally.",
            "parameters": {
                "type": "object",
                "properties": {
                    "result": {
                        "type": "string",
                        "enum": ["success", "partial_success", "failed", "callback_needed"],
                        "description": "Call outcome"
                    },
                    "reason": {"type": "string", "description": "Reason for the judgement"},
                    "summary": {"type": "string", "description": "Call summary"},
                    "collected_data": {"type": "object", "description": "All collected data"},
                },
                "required": ["result", "reason"],
            },
        }),
    ]
}

/// Tools are only attached in Agent mode; Relay mode purely translates.
pub fn tools_for_mode(mode: CallMode) -> Option<Vec<Value>> {
    match mode {
        CallMode::Agent => Some(agent_tools()),
        CallMode::Relay => None,
    }
}

/// Outcome of `end_call_judgment`, surfaced to the client as a call_status
/// message.
#[derive(Debug, Clone)]
pub struct CallJudgement {
    pub result: String,
    pub data: Value,
}

/// Execute one completed function call against the Call state. Returns the
/// JSON result string for the upstream, plus a judgement when the agent
/// declared the call finished.
pub fn execute(
    call: &mut Call,
    function_name: &str,
    arguments: &str,
) -> (String, Option<CallJudgement>) {
    let args: Value = serde_json::from_str(arguments).unwrap_or_else(|_| json!({}));
    info!("[FunctionExecutor] Executing {function_name}");

    let mut judgement = None;
    let result = match function_name {
        "confirm_reservation" => {
            call.collected_data
                .insert("reservation".to_string(), args.clone());
            json!({
                "status": "recorded",
                "reservation_status": args.get("status").and_then(Value::as_str).unwrap_or("unknown"),
            })
        }
        "search_location" => {
            call.collected_data
                .insert("location".to_string(), args.clone());
            json!({
                "status": "recorded",
                "place": args.get("place_name").and_then(Value::as_str).unwrap_or(""),
            })
        }
        "collect_info" => {
            let info_type = args
                .get("info_type")
                .and_then(Value::as_str)
                .unwrap_or("other")
                .to_string();
            let value = args.get("value").cloned().unwrap_or(Value::Null);
            call.collected_data.insert(info_type.clone(), value);
            json!({"status": "recorded", "info_type": info_type})
        }
        "end_call_judgment" => {
            let result = args
                .get("result")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let reason = args.get("reason").and_then(Value::as_str).unwrap_or("");
            call.call_result = result.clone();
            if let Some(map) = args.as_object() {
                for (k, v) in map {
                    call.call_result_data.insert(k.clone(), v.clone());
                }
            }
            info!("[FunctionExecutor] Call result: {result} -- {reason}");
            judgement = Some(CallJudgement {
                result: result.clone(),
                data: args.clone(),
            });
            json!({"status": "judged", "result": result})
        }
        other => json!({"status": "error", "message": format!("Unknown function: {other}")}),
    };

    (result.to_string(), judgement)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CallStartRequest, CommunicationMode};

    fn call() -> Call {
        Call::new(&CallStartRequest {
            call_id: "c-1".to_string(),
            phone_number: "+14155552671".to_string(),
            mode: CallMode::Agent,
            source_language: "en".to_string(),
            target_language: "ko".to_string(),
            collected_data: None,
            communication_mode: CommunicationMode::FullAgent,
            system_prompt_override: None,
        })
    }

    #[test]
    fn test_tools_only_in_agent_mode() {
        assert!(tools_for_mode(CallMode::Relay).is_none());
        let tools = tools_for_mode(CallMode::Agent).unwrap();
        assert_eq!(tools.len(), 4);
        assert_eq!(tools[0]["name"], "confirm_reservation");
    }

    #[test]
    fn test_collect_info_folds_into_call() {
        let mut c = call();
        let (result, judgement) = execute(
            &mut c,
            "collect_info",
            r#"{"info_type":"price","value":"45000"}"#,
        );
        assert!(judgement.is_none());
        assert_eq!(c.collected_data["price"], "45000");
        let parsed: Value = serde_json::from_str(&result).unwrap();
        assert_eq!(parsed["status"], "recorded");
    }

    #[test]
    fn test_end_call_judgment_sets_result() {
        let mut c = call();
        let (_, judgement) = execute(
            &mut c,
            "end_call_judgment",
            r#"{"result":"success","reason":"reservation confirmed"}"#,
        );
        assert_eq!(c.call_result, "success");
        assert_eq!(judgement.unwrap().result, "success");
        assert_eq!(c.call_result_data["reason"], "reservation confirmed");
    }

    #[test]
    fn test_unknown_function_reports_error() {
        let mut c = call();
        let (result, judgement) = execute(&mut c, "fly_to_moon", "{}");
        assert!(judgement.is_none());
        let parsed: Value = serde_json::from_str(&result).unwrap();
        assert_eq!(parsed["status"], "error");
    }

    #[test]
    fn test_malformed_arguments_treated_as_empty() {
        let mut c = call();
        let (result, _) = execute(&mut c, "confirm_reservation", "not json");
        let parsed: Value = serde_json::from_str(&result).unwrap();
        assert_eq!(parsed["reservation_status"], "unknown");
    }
}
