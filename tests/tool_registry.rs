use hostlink::config::ToolSettings;
use hostlink::error::ExecutionError;
use hostlink::tool::base::ToolDefinition;
use hostlink::tool::{catalog, ToolRegistry};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

fn builtin_registry() -> ToolRegistry {
    let registry = ToolRegistry::new();
    catalog::register_builtin_tools(&registry).unwrap();
    registry
}

#[test]
fn test_builtin_tools_registered() {
    let registry = builtin_registry();

    for name in [
        "create_object",
        "transform_object",
        "delete_object",
        "get_object_info",
        "get_scene_info",
        "create_camera",
        "set_active_camera",
        "create_light",
        "set_material",
        "create_material",
        "assign_material",
        "set_material_color",
        "insert_keyframe",
        "set_animation_range",
        "set_render_engine",
        "set_render_resolution",
        "render_image",
        "echo",
    ] {
        assert!(registry.get(name).is_some(), "{} should be registered", name);
    }
    assert_eq!(registry.len(), 18);
    assert!(registry.get("teleport").is_none());
}

#[test]
fn test_identical_registration_lists_once() {
    let registry = ToolRegistry::new();
    registry.register(catalog::create_object()).unwrap();
    registry.register(catalog::create_object()).unwrap();

    let listed: Vec<_> = registry.list(None).collect();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "create_object");
}

#[test]
fn test_replacement_keeps_latest() {
    let registry = ToolRegistry::new();
    registry.register(catalog::create_object()).unwrap();

    let mut replacement = catalog::create_object();
    replacement.description = "Spawn an object".to_string();
    registry.register(replacement).unwrap();

    assert_eq!(registry.get("create_object").unwrap().description, "Spawn an object");
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_list_by_category_is_sorted_and_restartable() {
    let registry = builtin_registry();

    let objects: Vec<String> = registry.list(Some("object")).map(|t| t.name.clone()).collect();
    assert_eq!(objects, vec!["create_object", "delete_object", "get_object_info", "transform_object"]);

    // A second pass yields the same sequence
    let again: Vec<String> = registry.list(Some("object")).map(|t| t.name.clone()).collect();
    assert_eq!(objects, again);

    assert_eq!(registry.list(Some("nonexistent")).count(), 0);
    assert_eq!(registry.list(None).count(), registry.len());
}

#[test]
fn test_categories() {
    let registry = builtin_registry();
    assert_eq!(
        registry.categories(),
        vec!["animation", "diagnostic", "light", "material", "object", "render", "scene"]
    );
}

#[test]
fn test_unregister() {
    let registry = builtin_registry();
    let removed = registry.unregister("render_image").unwrap();
    assert_eq!(removed.name, "render_image");
    assert!(registry.get("render_image").is_none());
    assert!(registry.unregister("render_image").is_none());
}

#[test]
fn test_validate_accepts_good_params() {
    let registry = builtin_registry();
    registry
        .validate(
            "create_object",
            &json!({"object_type": "MESH", "location": [0, 1.5, -2], "scale": [1, 1, 1]}),
        )
        .unwrap();
    registry
        .validate(
            "set_material",
            &json!({"object_name": "Cube", "color": [1, 0, 0, 1], "metallic": 0.5}),
        )
        .unwrap();
    registry
        .validate("render_image", &json!({"output_path": "/tmp/out.png", "resolution": {"x": 1920, "y": 1080}}))
        .unwrap();
}

#[test]
fn test_validate_missing_required_field() {
    let registry = builtin_registry();
    let err = registry.validate("create_object", &json!({})).unwrap_err();
    assert_eq!(err.subject, "create_object");
    assert!(err.message.contains("object_type"), "{}", err.message);
}

#[test]
fn test_validate_vector_length() {
    let registry = builtin_registry();
    let err = registry
        .validate("create_object", &json!({"object_type": "MESH", "location": [1, 2]}))
        .unwrap_err();
    assert!(err.message.starts_with("params/location"), "{}", err.message);

    let err = registry
        .validate("set_material", &json!({"object_name": "Cube", "color": [1, 0, 0]}))
        .unwrap_err();
    assert!(err.message.starts_with("params/color"), "{}", err.message);
}

#[test]
fn test_validate_wrong_type_and_range() {
    let registry = builtin_registry();

    let err = registry
        .validate("set_material", &json!({"object_name": "Cube", "color": "red"}))
        .unwrap_err();
    assert!(err.message.starts_with("params/color"), "{}", err.message);

    let err = registry
        .validate("create_light", &json!({"light_type": "POINT", "energy": -5}))
        .unwrap_err();
    assert!(err.message.starts_with("params/energy"), "{}", err.message);

    let err = registry
        .validate("create_light", &json!({"light_type": "LASER"}))
        .unwrap_err();
    assert!(err.message.starts_with("params/light_type"), "{}", err.message);

    let err = registry
        .validate("render_image", &json!({"output_path": "x.png", "samples": 0}))
        .unwrap_err();
    assert!(err.message.starts_with("params/samples"), "{}", err.message);
}

#[test]
fn test_validate_scene_and_animation_tools() {
    let registry = builtin_registry();

    registry
        .validate("transform_object", &json!({"object_name": "Cube", "scale": [2, 2, 2]}))
        .unwrap();
    let err = registry
        .validate("transform_object", &json!({"object_name": "Cube"}))
        .unwrap_err();
    assert!(err.message.starts_with("params:"), "{}", err.message);

    // Euler and quaternion rotations are both accepted
    registry
        .validate("insert_keyframe", &json!({"object_name": "Cube", "frame": 10, "rotation": [0, 0, 1]}))
        .unwrap();
    registry
        .validate("insert_keyframe", &json!({"object_name": "Cube", "rotation": [1, 0, 0, 0]}))
        .unwrap();
    let err = registry
        .validate("insert_keyframe", &json!({"object_name": "Cube", "frame": -1}))
        .unwrap_err();
    assert!(err.message.starts_with("params/frame"), "{}", err.message);

    registry
        .validate("set_animation_range", &json!({"start_frame": 1, "end_frame": 250}))
        .unwrap();
    registry.validate("create_camera", &json!({"location": [0, -10, 5]})).unwrap();
    registry
        .validate("set_active_camera", &json!({}))
        .unwrap_err();

    let err = registry
        .validate("set_material_color", &json!({"material_name": "Steel"}))
        .unwrap_err();
    assert!(err.message.contains("color"), "{}", err.message);
    registry
        .validate("assign_material", &json!({"object_name": "Cube", "material_name": "Steel"}))
        .unwrap();

    let err = registry
        .validate("set_render_engine", &json!({"engine": "POVRAY"}))
        .unwrap_err();
    assert!(err.message.starts_with("params/engine"), "{}", err.message);
    let err = registry
        .validate(
            "set_render_resolution",
            &json!({"resolution_x": 1920, "resolution_y": 1080, "percentage": 150}),
        )
        .unwrap_err();
    assert!(err.message.starts_with("params/percentage"), "{}", err.message);
}

#[test]
fn test_validate_unknown_tool() {
    let registry = builtin_registry();
    let err = registry.validate("teleport", &json!({})).unwrap_err();
    assert_eq!(err.subject, "teleport");
    assert_eq!(err.message, "unknown tool");
}

#[test]
fn test_invalid_schema_rejected() {
    let registry = ToolRegistry::new();
    let err = registry
        .register(ToolDefinition::new(
            "broken",
            "Bad schema",
            "diagnostic",
            json!({"type": 12}),
        ))
        .unwrap_err();
    assert_eq!(err.subject, "broken");
    assert!(registry.is_empty());
}

#[test]
fn test_overlay_disables_and_supplies_defaults() {
    let mut overlay = HashMap::new();
    overlay.insert(
        "render_image".to_string(),
        ToolSettings {
            enabled: false,
            parameters: HashMap::new(),
        },
    );
    let mut light_defaults = HashMap::new();
    light_defaults.insert("energy".to_string(), json!(1000));
    overlay.insert(
        "create_light".to_string(),
        ToolSettings {
            enabled: true,
            parameters: light_defaults,
        },
    );

    let registry = ToolRegistry::with_overlay(overlay);
    catalog::register_builtin_tools(&registry).unwrap();

    assert!(!registry.is_enabled("render_image"));
    assert!(registry.is_enabled("create_light"));
    assert!(!registry.is_enabled("teleport"));

    let err = registry
        .check("render_image", &json!({"output_path": "x.png"}))
        .unwrap_err();
    assert_eq!(err.message, "tool is disabled");

    let params = registry.apply_defaults("create_light", json!({"light_type": "SUN"}));
    assert_eq!(params, json!({"light_type": "SUN", "energy": 1000}));

    // Caller-supplied values win
    let params = registry.apply_defaults("create_light", json!({"light_type": "SUN", "energy": 3}));
    assert_eq!(params["energy"], 3);

    assert_eq!(registry.tool_parameters("create_light").get("energy"), Some(&json!(1000)));
    assert!(registry.tool_parameters("echo").is_empty());

    let records = registry.schema_records();
    let render = records.iter().find(|r| r.name == "render_image").unwrap();
    assert!(!render.enabled);
}

#[test]
fn test_disabled_definition() {
    let registry = ToolRegistry::new();
    registry.register(catalog::delete_object().disabled()).unwrap();
    assert!(!registry.is_enabled("delete_object"));
}

#[test]
fn test_invoke_dispatches_by_name() {
    let registry = builtin_registry();
    registry
        .register(
            ToolDefinition::new("double", "Doubles n", "diagnostic", json!({"type": "object"}))
                .with_handler(Arc::new(|params: Value| -> Result<Value, ExecutionError> {
                    let n = params["n"].as_i64().ok_or("n must be an integer")?;
                    Ok(json!(n * 2))
                })),
        )
        .unwrap();

    assert_eq!(registry.invoke("double", json!({"n": 21})).unwrap(), json!(42));
    assert_eq!(
        registry.invoke("double", json!({})).unwrap_err().message,
        "n must be an integer"
    );
    assert_eq!(registry.invoke("echo", json!([1, 2])).unwrap(), json!([1, 2]));
    assert!(registry.invoke("teleport", json!({})).is_err());
}

#[test]
fn test_schema_records_shape() {
    let registry = builtin_registry();
    let records = registry.schema_records();
    assert_eq!(records.len(), 18);

    let record = serde_json::to_value(&records[0]).unwrap();
    for key in ["name", "description", "category", "parameters", "enabled"] {
        assert!(record.get(key).is_some(), "record missing {}", key);
    }
}

#[test]
fn test_simulated_host_acknowledges() {
    let registry = ToolRegistry::new();
    catalog::register_simulated_host(&registry).unwrap();

    let result = registry
        .invoke("delete_object", json!({"object_name": "Cube"}))
        .unwrap();
    assert_eq!(result["tool"], "delete_object");
    assert_eq!(result["accepted"], true);
    assert_eq!(result["params"]["object_name"], "Cube");
}
