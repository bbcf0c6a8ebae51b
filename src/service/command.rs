//! Backend command construction.
//!
//! Builds the inference backend argv from the model path, network
//! parameters, and the model family detected from the manifest folder name.
//! Family-specific chat templates and best-practice flag files are looked
//! up under the resource directory and silently skipped when absent.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

/// Offload every layer to the accelerator. The backend treats any value
/// beyond the layer count as "all layers".
const NGL_ALL_LAYERS: &str = "9999";

/// Model families with dedicated chat templates, in detection order.
const FAMILIES: [&str; 4] = ["gemma", "qwen25", "qwen3", "llama"];

/// A fully resolved backend invocation.
#[derive(Debug, Clone)]
pub struct CommandPlan {
    /// The argv to spawn, starting with the executable.
    pub argv: Vec<String>,
    /// Effective context length (may be reduced for memory-hungry
    /// families).
    pub context_length: u32,
}

/// Detects the model family from a manifest folder name,
/// case-insensitively.
#[must_use]
pub fn family_from_folder(folder_name: &str) -> Option<&'static str> {
    let lowered = folder_name.to_lowercase();
    FAMILIES.iter().find(|f| lowered.contains(*f)).copied()
}

/// Path of the family chat template, if one is installed.
#[must_use]
pub fn template_path(resource_dir: &Path, family: &str) -> Option<PathBuf> {
    let path = resource_dir.join("templates").join(format!("{family}.jinja"));
    path.exists().then_some(path)
}

/// Path of the family best-practice flag file, if one is installed.
#[must_use]
pub fn best_practice_path(resource_dir: &Path, family: &str) -> Option<PathBuf> {
    let path = resource_dir
        .join("best_practices")
        .join(format!("{family}.json"));
    path.exists().then_some(path)
}

/// Plans the backend invocation for a model.
///
/// Family rules: `gemma` halves the context length and uses only the chat
/// template; `qwen25`, `qwen3`, and `llama` use both template and
/// best-practice file; unknown families use neither.
///
/// # Errors
///
/// Returns an I/O error if a best-practice file exists but cannot be read
/// or parsed.
pub fn plan_backend_command(
    llama_server: &Path,
    resource_dir: &Path,
    model_path: &Path,
    port: u16,
    host: &str,
    context_length: u32,
    folder_name: &str,
) -> io::Result<CommandPlan> {
    let family = family_from_folder(folder_name);
    debug!(folder_name, ?family, "planning backend command");

    let (context_length, template, best_practice) = match family {
        Some("gemma") => (
            // Gemma is memory intensive; run with half the requested
            // context.
            context_length / 2,
            template_path(resource_dir, "gemma"),
            None,
        ),
        Some(family) => (
            context_length,
            template_path(resource_dir, family),
            best_practice_path(resource_dir, family),
        ),
        None => (context_length, None, None),
    };

    let argv = build_backend_command(
        llama_server,
        model_path,
        port,
        host,
        context_length,
        template.as_deref(),
        best_practice.as_deref(),
    )?;
    Ok(CommandPlan {
        argv,
        context_length,
    })
}

/// Builds the backend argv with the fixed base flags, then the optional
/// template and best-practice additions.
///
/// # Errors
///
/// Returns an I/O error if the best-practice file cannot be read or parsed.
pub fn build_backend_command(
    llama_server: &Path,
    model_path: &Path,
    port: u16,
    host: &str,
    context_length: u32,
    template: Option<&Path>,
    best_practice: Option<&Path>,
) -> io::Result<Vec<String>> {
    let mut argv = vec![
        llama_server.display().to_string(),
        "--model".to_string(),
        model_path.display().to_string(),
        "--port".to_string(),
        port.to_string(),
        "--host".to_string(),
        host.to_string(),
        "-c".to_string(),
        context_length.to_string(),
        "-fa".to_string(),
        "--pooling".to_string(),
        "mean".to_string(),
        "--no-webui".to_string(),
        "-ngl".to_string(),
        NGL_ALL_LAYERS.to_string(),
        "--no-mmap".to_string(),
        "--mlock".to_string(),
        "--jinja".to_string(),
        "--reasoning-format".to_string(),
        "none".to_string(),
    ];

    if let Some(template) = template {
        argv.push("--chat-template-file".to_string());
        argv.push(template.display().to_string());
    }

    if let Some(best_practice) = best_practice {
        let raw = fs::read_to_string(best_practice)?;
        let parsed: Value = serde_json::from_str(&raw).map_err(io::Error::other)?;
        let Some(map) = parsed.as_object() else {
            return Err(io::Error::other(format!(
                "best-practice file {} is not a JSON object",
                best_practice.display()
            )));
        };
        // Pairs are appended in the file's key order. Booleans render
        // capitalized ("True"/"False").
        for (key, value) in map {
            argv.push(format!("--{key}"));
            argv.push(match value {
                Value::String(s) => s.clone(),
                Value::Bool(true) => "True".to_string(),
                Value::Bool(false) => "False".to_string(),
                other => other.to_string(),
            });
        }
    }

    Ok(argv)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn write_resources(dir: &Path, family: &str, best_practice: Option<&str>) {
        let templates = dir.join("templates");
        fs::create_dir_all(&templates).unwrap();
        fs::write(templates.join(format!("{family}.jinja")), "{{ messages }}").unwrap();
        if let Some(json) = best_practice {
            let practices = dir.join("best_practices");
            fs::create_dir_all(&practices).unwrap();
            fs::write(practices.join(format!("{family}.json")), json).unwrap();
        }
    }

    fn args_of(plan: &CommandPlan) -> Vec<&str> {
        plan.argv.iter().map(String::as_str).collect()
    }

    #[test]
    fn test_family_detection_is_case_insensitive() {
        assert_eq!(family_from_folder("Gemma-2b"), Some("gemma"));
        assert_eq!(family_from_folder("QWEN25-7B"), Some("qwen25"));
        assert_eq!(family_from_folder("my-qwen3-model"), Some("qwen3"));
        assert_eq!(family_from_folder("LLaMA-8B"), Some("llama"));
        assert_eq!(family_from_folder("mistral-7b"), None);
    }

    #[test]
    fn test_base_argv_order_and_flags() {
        let argv = build_backend_command(
            Path::new("/opt/llama-server"),
            Path::new("/models/QmA.gguf"),
            8123,
            "0.0.0.0",
            32768,
            None,
            None,
        )
        .unwrap();

        assert_eq!(argv[0], "/opt/llama-server");
        let expected_tail = [
            "--model",
            "/models/QmA.gguf",
            "--port",
            "8123",
            "--host",
            "0.0.0.0",
            "-c",
            "32768",
            "-fa",
            "--pooling",
            "mean",
            "--no-webui",
            "-ngl",
            "9999",
            "--no-mmap",
            "--mlock",
            "--jinja",
            "--reasoning-format",
            "none",
        ];
        assert_eq!(&argv[1..], expected_tail);
    }

    #[test]
    fn test_gemma_halves_context_and_skips_best_practice() {
        let dir = tempfile::tempdir().unwrap();
        write_resources(dir.path(), "gemma", Some(r#"{"temp": 0.7}"#));

        let plan = plan_backend_command(
            Path::new("/opt/llama-server"),
            dir.path(),
            Path::new("/models/QmA.gguf"),
            8123,
            "0.0.0.0",
            32768,
            "gemma-2b",
        )
        .unwrap();

        assert_eq!(plan.context_length, 16384);
        let args = args_of(&plan);
        let c_index = args.iter().position(|a| *a == "-c").unwrap();
        assert_eq!(args[c_index + 1], "16384");
        assert!(args.contains(&"--chat-template-file"));
        assert!(
            !args.contains(&"--temp"),
            "gemma must not receive best-practice pairs"
        );
    }

    #[test]
    fn test_qwen_uses_template_and_best_practice() {
        let dir = tempfile::tempdir().unwrap();
        write_resources(dir.path(), "qwen25", Some(r#"{"top-k": 20, "temp": 0.6}"#));

        let plan = plan_backend_command(
            Path::new("/opt/llama-server"),
            dir.path(),
            Path::new("/models/QmA.gguf"),
            8123,
            "127.0.0.1",
            32768,
            "qwen25-7b-instruct",
        )
        .unwrap();

        assert_eq!(plan.context_length, 32768);
        let args = args_of(&plan);
        assert!(args.contains(&"--chat-template-file"));
        let top_k = args.iter().position(|a| *a == "--top-k").unwrap();
        assert_eq!(args[top_k + 1], "20");
    }

    #[test]
    fn test_best_practice_pairs_follow_file_order() {
        let dir = tempfile::tempdir().unwrap();
        // Keys deliberately not alphabetical.
        write_resources(
            dir.path(),
            "llama",
            Some(r#"{"top-p": 0.95, "min-p": 0.05, "temp": 0.8}"#),
        );

        let plan = plan_backend_command(
            Path::new("/opt/llama-server"),
            dir.path(),
            Path::new("/models/QmA.gguf"),
            8123,
            "127.0.0.1",
            4096,
            "llama-3-8b",
        )
        .unwrap();

        let args = args_of(&plan);
        let positions: Vec<usize> = ["--top-p", "--min-p", "--temp"]
            .iter()
            .map(|flag| args.iter().position(|a| a == flag).unwrap())
            .collect();
        assert!(
            positions.windows(2).all(|w| w[0] < w[1]),
            "pairs must keep file order: {positions:?}"
        );
    }

    #[test]
    fn test_unknown_family_gets_neither_extra() {
        let dir = tempfile::tempdir().unwrap();
        write_resources(dir.path(), "llama", Some(r#"{"temp": 0.8}"#));

        let plan = plan_backend_command(
            Path::new("/opt/llama-server"),
            dir.path(),
            Path::new("/models/QmA.gguf"),
            8123,
            "127.0.0.1",
            4096,
            "mystery-model",
        )
        .unwrap();

        let args = args_of(&plan);
        assert!(!args.contains(&"--chat-template-file"));
        assert!(!args.contains(&"--temp"));
    }

    #[test]
    fn test_missing_resources_are_skipped_silently() {
        let dir = tempfile::tempdir().unwrap();

        let plan = plan_backend_command(
            Path::new("/opt/llama-server"),
            dir.path(),
            Path::new("/models/QmA.gguf"),
            8123,
            "127.0.0.1",
            4096,
            "qwen3-4b",
        )
        .unwrap();

        let args = args_of(&plan);
        assert!(!args.contains(&"--chat-template-file"));
    }

    #[test]
    fn test_string_values_render_without_quotes() {
        let dir = tempfile::tempdir().unwrap();
        write_resources(dir.path(), "qwen3", Some(r#"{"samplers": "top_k;top_p"}"#));

        let plan = plan_backend_command(
            Path::new("/opt/llama-server"),
            dir.path(),
            Path::new("/models/QmA.gguf"),
            8123,
            "127.0.0.1",
            4096,
            "qwen3-4b",
        )
        .unwrap();

        let args = args_of(&plan);
        let samplers = args.iter().position(|a| *a == "--samplers").unwrap();
        assert_eq!(args[samplers + 1], "top_k;top_p");
    }

    #[test]
    fn test_bool_values_render_capitalized() {
        let dir = tempfile::tempdir().unwrap();
        write_resources(
            dir.path(),
            "qwen3",
            Some(r#"{"cont-batching": true, "escape": false}"#),
        );

        let plan = plan_backend_command(
            Path::new("/opt/llama-server"),
            dir.path(),
            Path::new("/models/QmA.gguf"),
            8123,
            "127.0.0.1",
            4096,
            "qwen3-4b",
        )
        .unwrap();

        let args = args_of(&plan);
        let batching = args.iter().position(|a| *a == "--cont-batching").unwrap();
        assert_eq!(args[batching + 1], "True");
        let escape = args.iter().position(|a| *a == "--escape").unwrap();
        assert_eq!(args[escape + 1], "False");
    }
}
