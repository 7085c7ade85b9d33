//! Built-in tool definitions for the standard host operations.
//!
//! Only `echo` carries a handler here. Scene-mutating handlers belong to the
//! host integration and are attached with [`ToolDefinition::with_handler`]
//! before registration.

use super::base::{Handler, ToolDefinition};
use super::ToolRegistry;
use crate::error::{ExecutionError, ValidationError};
use serde_json::{json, Value};
use std::sync::Arc;

fn object_name() -> Value {
    json!({
        "type": "string",
        "description": "Object name",
        "minLength": 1
    })
}

/// Fixed-length XYZ vector
fn vector3(description: &str) -> Value {
    json!({
        "type": "array",
        "items": {"type": "number"},
        "minItems": 3,
        "maxItems": 3,
        "description": description
    })
}

fn material_name() -> Value {
    json!({
        "type": "string",
        "description": "Material name",
        "minLength": 1
    })
}

fn frame(description: &str) -> Value {
    json!({"type": "integer", "minimum": 0, "description": description})
}

fn unit_interval() -> Value {
    json!({"type": "number", "minimum": 0, "maximum": 1})
}

fn rgba_color() -> Value {
    json!({
        "type": "array",
        "items": {"type": "number", "minimum": 0, "maximum": 1},
        "minItems": 4,
        "maxItems": 4,
        "description": "RGBA color, components in [0, 1]"
    })
}

pub fn create_object() -> ToolDefinition {
    ToolDefinition::new(
        "create_object",
        "Create a new object in the scene",
        "object",
        json!({
            "type": "object",
            "properties": {
                "object_type": {"type": "string", "enum": ["MESH", "CURVE", "LIGHT", "CAMERA"]},
                "object_name": object_name(),
                "location": vector3("Location (X, Y, Z)"),
                "rotation": vector3("Rotation in radians (X, Y, Z)"),
                "scale": vector3("Scale (X, Y, Z)")
            },
            "required": ["object_type"]
        }),
    )
}

pub fn transform_object() -> ToolDefinition {
    ToolDefinition::new(
        "transform_object",
        "Move, rotate or scale an existing object",
        "object",
        json!({
            "type": "object",
            "properties": {
                "object_name": object_name(),
                "location": vector3("Location (X, Y, Z)"),
                "rotation": vector3("Rotation in radians (X, Y, Z)"),
                "scale": vector3("Scale (X, Y, Z)")
            },
            "required": ["object_name"],
            "anyOf": [
                {"required": ["location"]},
                {"required": ["rotation"]},
                {"required": ["scale"]}
            ]
        }),
    )
}

pub fn delete_object() -> ToolDefinition {
    ToolDefinition::new(
        "delete_object",
        "Delete an object from the scene",
        "object",
        json!({
            "type": "object",
            "properties": {"object_name": object_name()},
            "required": ["object_name"]
        }),
    )
}

pub fn get_object_info() -> ToolDefinition {
    ToolDefinition::new(
        "get_object_info",
        "Get information about an object",
        "object",
        json!({
            "type": "object",
            "properties": {"object_name": object_name()},
            "required": ["object_name"]
        }),
    )
}

pub fn get_scene_info() -> ToolDefinition {
    ToolDefinition::new(
        "get_scene_info",
        "Get information about the current scene",
        "scene",
        json!({"type": "object", "properties": {}}),
    )
}

pub fn set_material() -> ToolDefinition {
    ToolDefinition::new(
        "set_material",
        "Create or assign a material on an object",
        "material",
        json!({
            "type": "object",
            "properties": {
                "object_name": object_name(),
                "material_name": {"type": "string", "description": "Material name"},
                "color": rgba_color(),
                "metallic": unit_interval(),
                "roughness": unit_interval()
            },
            "required": ["object_name"]
        }),
    )
}

pub fn create_material() -> ToolDefinition {
    ToolDefinition::new(
        "create_material",
        "Create a material without assigning it",
        "material",
        json!({
            "type": "object",
            "properties": {
                "name": material_name(),
                "color": rgba_color(),
                "metallic": unit_interval(),
                "roughness": unit_interval()
            }
        }),
    )
}

pub fn assign_material() -> ToolDefinition {
    ToolDefinition::new(
        "assign_material",
        "Assign an existing material to an object",
        "material",
        json!({
            "type": "object",
            "properties": {
                "object_name": object_name(),
                "material_name": material_name()
            },
            "required": ["object_name", "material_name"]
        }),
    )
}

pub fn set_material_color() -> ToolDefinition {
    ToolDefinition::new(
        "set_material_color",
        "Change the base color of a material",
        "material",
        json!({
            "type": "object",
            "properties": {
                "material_name": material_name(),
                "color": rgba_color()
            },
            "required": ["material_name", "color"]
        }),
    )
}

pub fn create_light() -> ToolDefinition {
    ToolDefinition::new(
        "create_light",
        "Create a light",
        "light",
        json!({
            "type": "object",
            "properties": {
                "light_type": {"type": "string", "enum": ["POINT", "SUN", "SPOT", "AREA"]},
                "object_name": object_name(),
                "location": vector3("Location (X, Y, Z)"),
                "energy": {"type": "number", "minimum": 0, "description": "Light power"},
                "color": rgba_color()
            },
            "required": ["light_type"]
        }),
    )
}

pub fn create_camera() -> ToolDefinition {
    ToolDefinition::new(
        "create_camera",
        "Add a camera to the scene",
        "scene",
        json!({
            "type": "object",
            "properties": {
                "name": object_name(),
                "location": vector3("Location (X, Y, Z)"),
                "rotation": vector3("Rotation in radians (X, Y, Z)")
            }
        }),
    )
}

pub fn set_active_camera() -> ToolDefinition {
    ToolDefinition::new(
        "set_active_camera",
        "Make a camera the scene's active camera",
        "scene",
        json!({
            "type": "object",
            "properties": {"camera_name": object_name()},
            "required": ["camera_name"]
        }),
    )
}

pub fn insert_keyframe() -> ToolDefinition {
    ToolDefinition::new(
        "insert_keyframe",
        "Key an object's transform at a frame",
        "animation",
        json!({
            "type": "object",
            "properties": {
                "object_name": object_name(),
                "frame": frame("Frame to key; the current frame when omitted"),
                "location": vector3("Location (X, Y, Z)"),
                "rotation": {
                    "type": "array",
                    "items": {"type": "number"},
                    "minItems": 3,
                    "maxItems": 4,
                    "description": "Euler (X, Y, Z) or quaternion (W, X, Y, Z)"
                },
                "scale": vector3("Scale (X, Y, Z)")
            },
            "required": ["object_name"]
        }),
    )
}

pub fn set_animation_range() -> ToolDefinition {
    ToolDefinition::new(
        "set_animation_range",
        "Set the scene's start, end and current frame",
        "animation",
        json!({
            "type": "object",
            "properties": {
                "start_frame": frame("First frame"),
                "end_frame": frame("Last frame"),
                "current_frame": frame("Frame to jump to")
            }
        }),
    )
}

pub fn set_render_engine() -> ToolDefinition {
    ToolDefinition::new(
        "set_render_engine",
        "Choose the render engine and compute device",
        "render",
        json!({
            "type": "object",
            "properties": {
                "engine": {"type": "string", "enum": ["CYCLES", "BLENDER_EEVEE", "WORKBENCH"]},
                "device": {"type": "string", "enum": ["CPU", "GPU"]}
            },
            "required": ["engine"]
        }),
    )
}

pub fn set_render_resolution() -> ToolDefinition {
    ToolDefinition::new(
        "set_render_resolution",
        "Set the output resolution",
        "render",
        json!({
            "type": "object",
            "properties": {
                "resolution_x": {"type": "integer", "minimum": 1},
                "resolution_y": {"type": "integer", "minimum": 1},
                "percentage": {"type": "integer", "minimum": 1, "maximum": 100}
            },
            "required": ["resolution_x", "resolution_y"]
        }),
    )
}

pub fn render_image() -> ToolDefinition {
    ToolDefinition::new(
        "render_image",
        "Render the current scene to a file",
        "render",
        json!({
            "type": "object",
            "properties": {
                "output_path": {"type": "string", "minLength": 1},
                "resolution": {
                    "type": "object",
                    "properties": {
                        "x": {"type": "integer", "minimum": 1},
                        "y": {"type": "integer", "minimum": 1}
                    },
                    "required": ["x", "y"]
                },
                "samples": {"type": "integer", "minimum": 1}
            },
            "required": ["output_path"]
        }),
    )
}

/// Returns its params unchanged
pub struct EchoHandler;

impl Handler for EchoHandler {
    fn call(&self, params: Value) -> Result<Value, ExecutionError> {
        Ok(params)
    }
}

pub fn echo() -> ToolDefinition {
    ToolDefinition::new(
        "echo",
        "Return the given parameters unchanged",
        "diagnostic",
        json!({"type": "object"}),
    )
    .with_handler(Arc::new(EchoHandler))
}

/// Acknowledges a request without touching any scene. Stands in for the host
/// when the relay runs without one attached.
pub struct AcknowledgeHandler {
    tool: String,
}

impl AcknowledgeHandler {
    pub fn new(tool: impl Into<String>) -> Self {
        Self { tool: tool.into() }
    }
}

impl Handler for AcknowledgeHandler {
    fn call(&self, params: Value) -> Result<Value, ExecutionError> {
        Ok(json!({
            "tool": self.tool,
            "accepted": true,
            "params": params,
        }))
    }
}

/// All built-in definitions
pub fn builtin_tools() -> Vec<ToolDefinition> {
    vec![
        create_object(),
        transform_object(),
        delete_object(),
        get_object_info(),
        get_scene_info(),
        create_camera(),
        set_active_camera(),
        create_light(),
        set_material(),
        create_material(),
        assign_material(),
        set_material_color(),
        insert_keyframe(),
        set_animation_range(),
        set_render_engine(),
        set_render_resolution(),
        render_image(),
        echo(),
    ]
}

pub fn register_builtin_tools(registry: &ToolRegistry) -> Result<usize, ValidationError> {
    registry.register_all(builtin_tools())
}

/// Built-ins with an [`AcknowledgeHandler`] on every tool that lacks one
pub fn register_simulated_host(registry: &ToolRegistry) -> Result<usize, ValidationError> {
    registry.register_all(builtin_tools().into_iter().map(|tool| {
        if tool.handler.is_some() {
            tool
        } else {
            let handler = Arc::new(AcknowledgeHandler::new(&tool.name));
            tool.with_handler(handler)
        }
    }))
}
