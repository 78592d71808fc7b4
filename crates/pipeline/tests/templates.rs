//! The shipped workflow templates render completely for every kind.

mod common;

use atelier_core::generation::{resolve_request, WorkflowKind};
use atelier_pipeline::template::{build_generation_params, node_titles, RenderError};
use common::{request, templates};

#[test]
fn all_shipped_templates_load() {
    let engine = templates();
    for kind in [WorkflowKind::Text2img, WorkflowKind::Img2img, WorkflowKind::Upscale] {
        assert!(engine.contains(kind.template_name()), "{} missing", kind.template_name());
    }
}

#[test]
fn text2img_renders_typed_values() {
    let generation = resolve_request(&request(3)).unwrap();
    let job = templates()
        .render("text2img_basic.json", &build_generation_params(&generation))
        .unwrap();

    assert_eq!(job["5"]["inputs"]["width"], 1024);
    assert_eq!(job["5"]["inputs"]["batch_size"], 3);
    assert_eq!(job["3"]["inputs"]["cfg"], 7.5);
    assert_eq!(job["10"]["inputs"]["stop_at_clip_layer"], -2);
    assert_eq!(job["4"]["inputs"]["ckpt_name"], "sd_xl_base_1.0.safetensors");
    assert!(!job.to_string().contains("PLACEHOLDER_"));

    let titles = node_titles(&job);
    assert_eq!(titles.get("6").map(String::as_str), Some("Positive Prompt"));
}

#[test]
fn img2img_and_upscale_render_with_an_input_image() {
    let engine = templates();
    for kind in ["img2img", "upscale"] {
        let mut req = request(1);
        req.workflow = serde_json::from_value(serde_json::json!(kind)).unwrap();
        req.input_image = Some("source_0001.png".into());
        let generation = resolve_request(&req).unwrap();

        let job = engine
            .render(generation.workflow.template_name(), &build_generation_params(&generation))
            .unwrap();
        assert!(job.to_string().contains("source_0001.png"), "{kind}");
        assert!(!job.to_string().contains("PLACEHOLDER_"), "{kind}");
    }
}

#[test]
fn missing_input_image_leaves_slot_unresolved() {
    let mut req = request(1);
    req.input_image = None;
    let generation = resolve_request(&req).unwrap();

    let err = templates()
        .render("img2img_basic.json", &build_generation_params(&generation))
        .unwrap_err();
    match err {
        RenderError::Unresolved { missing, .. } => {
            assert_eq!(missing, vec!["INPUT_IMAGE".to_string()])
        }
        other => panic!("unexpected error: {other}"),
    }
}
