//! JSON schemas embedded in planning prompts.
//!
//! Schemas are strict: every object forbids extra properties and lists all
//! of its properties as required, with optional fields made nullable.

use serde_json::{json, Value};

const STATUS_ENUM: [&str; 4] = ["not_started", "in_progress", "blocked", "completed"];

fn substep_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "substep": {"type": "number", "description": "Substep identifier, e.g. 2.1 for the first substep of step 2."},
            "description": {"type": "string"},
            "status": {"type": "string", "enum": STATUS_ENUM}
        },
        "required": ["substep", "description", "status"],
        "additionalProperties": false
    })
}

fn plan_step_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "step": {"type": "integer", "description": "Step identifier."},
            "description": {"type": "string"},
            "status": {"type": "string", "enum": STATUS_ENUM},
            "substeps": {
                "anyOf": [
                    {"type": "array", "items": substep_schema()},
                    {"type": "null"}
                ]
            }
        },
        "required": ["step", "description", "status", "substeps"],
        "additionalProperties": false
    })
}

/// Schema of the `plan` array returned by plan generation.
pub fn plan_schema() -> Value {
    json!({
        "type": "array",
        "description": "Structured execution plan.",
        "items": plan_step_schema()
    })
}

/// Schema of the progress check reply.
pub fn progress_check_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "verdict": {
                "type": "string",
                "enum": ["continue", "completed", "failed"],
                "description": "'continue' while in progress, 'completed' when done, 'failed' on an unresolvable issue."
            },
            "plan_needs_update": {"type": "boolean"},
            "plan_status_update": {
                "anyOf": [
                    {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "step": {"type": "integer"},
                                "substep": {"anyOf": [{"type": "number"}, {"type": "null"}]},
                                "status": {"type": "string", "enum": STATUS_ENUM}
                            },
                            "required": ["step", "substep", "status"],
                            "additionalProperties": false
                        }
                    },
                    {"type": "null"}
                ]
            },
            "plan_restructure": {
                "anyOf": [
                    {"type": "array", "items": plan_step_schema(), "maxItems": 1},
                    {"type": "null"}
                ],
                "description": "Restructured steps. Only one step may be modified at a time."
            }
        },
        "required": ["verdict", "plan_needs_update", "plan_status_update", "plan_restructure"],
        "additionalProperties": false
    })
}

/// Schema of the next speaker selection.
pub fn next_step_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "next_agent": {"type": "string", "description": "Name of the agent selected to respond next."},
            "instruction": {"type": "string", "description": "Direct instruction for that agent."},
            "step": {"type": "integer", "description": "Step the agent will work on."},
            "substep": {"anyOf": [{"type": "number"}, {"type": "null"}], "description": "Substep the agent will work on, if any."}
        },
        "required": ["next_agent", "instruction", "step", "substep"],
        "additionalProperties": false
    })
}
