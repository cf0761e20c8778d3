//! Workflow input parsing and fan-out planning.
//!
//! `input_spec` is persisted as opaque JSON; this module is the single place
//! that gives it a shape. It is parsed twice: at admission (validation) and in
//! the worker (expansion into prompt tasks). The workflow type comes from the
//! workflow row, never from the payload itself.

use serde::Deserialize;
use thiserror::Error;

use crate::model::WorkflowType;
use generator::{ModelVariant, OutputSize};

#[derive(Error, Debug)]
pub enum SpecError {
    #[error("prompts field is missing")]
    MissingPrompts,

    #[error("prompts are empty")]
    EmptyPrompts,

    #[error("invalid input spec: {0}")]
    Invalid(String),
}

/// Options shared by every workflow type.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerationOptions {
    #[serde(default)]
    pub model: Option<ModelVariant>,
    #[serde(default)]
    pub aspect_ratio: Option<String>,
    #[serde(default)]
    pub size: Option<OutputSize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetFormat {
    pub name: String,
    pub width: u32,
    pub height: u32,
}

/// Validated, typed view of an execution's input.
#[derive(Debug, Clone)]
pub enum InputSpec {
    NanoBanana {
        prompts: Vec<String>,
        options: GenerationOptions,
    },
    Standard {
        prompt: String,
        options: GenerationOptions,
    },
    /// Masters arrive as reference uploads; the input itself carries only
    /// the target formats.
    SmartResizer {
        formats: Vec<TargetFormat>,
        options: GenerationOptions,
    },
    /// Room images arrive as reference uploads.
    RoomRedesigner {
        style: String,
        room_type: Option<String>,
        options: GenerationOptions,
    },
}

#[derive(Deserialize)]
struct NanoBananaRaw {
    prompts: Option<Vec<String>>,
    prompts_text: Option<String>,
    #[serde(flatten)]
    options: GenerationOptions,
}

#[derive(Deserialize)]
struct StandardRaw {
    prompt: Option<String>,
    prompts_text: Option<String>,
    #[serde(flatten)]
    options: GenerationOptions,
}

#[derive(Deserialize)]
struct SmartResizerRaw {
    formats: Vec<TargetFormat>,
    #[serde(flatten)]
    options: GenerationOptions,
}

#[derive(Deserialize)]
struct RoomRedesignerRaw {
    style: Option<String>,
    room_type: Option<String>,
    #[serde(flatten)]
    options: GenerationOptions,
}

impl InputSpec {
    pub fn parse(
        workflow_type: WorkflowType,
        value: &serde_json::Value,
    ) -> Result<Self, SpecError> {
        match workflow_type {
            WorkflowType::NanoBanana => {
                let raw: NanoBananaRaw = from_value(value)?;
                if raw.prompts.is_none() && raw.prompts_text.is_none() {
                    return Err(SpecError::MissingPrompts);
                }

                let prompts = match raw.prompts {
                    Some(list) => list,
                    None => raw
                        .prompts_text
                        .unwrap_or_default()
                        .lines()
                        .map(str::to_string)
                        .collect(),
                };

                let prompts: Vec<String> = prompts
                    .into_iter()
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect();

                if prompts.is_empty() {
                    return Err(SpecError::EmptyPrompts);
                }

                Ok(InputSpec::NanoBanana {
                    prompts,
                    options: raw.options,
                })
            }

            WorkflowType::Standard => {
                let raw: StandardRaw = from_value(value)?;
                let prompt = match raw.prompt.or(raw.prompts_text) {
                    Some(p) => p,
                    None => return Err(SpecError::MissingPrompts),
                };

                let prompt = prompt.trim().to_string();
                if prompt.is_empty() {
                    return Err(SpecError::EmptyPrompts);
                }

                Ok(InputSpec::Standard {
                    prompt,
                    options: raw.options,
                })
            }

            WorkflowType::SmartResizer => {
                let raw: SmartResizerRaw = from_value(value)?;
                if raw.formats.is_empty() {
                    return Err(SpecError::Invalid("at least one target format".into()));
                }
                for f in &raw.formats {
                    if f.width == 0 || f.height == 0 {
                        return Err(SpecError::Invalid(format!(
                            "format {} has zero dimension",
                            f.name
                        )));
                    }
                }

                Ok(InputSpec::SmartResizer {
                    formats: raw.formats,
                    options: raw.options,
                })
            }

            WorkflowType::RoomRedesigner => {
                let raw: RoomRedesignerRaw = from_value(value)?;
                let style = raw
                    .style
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| SpecError::Invalid("style is required".into()))?;

                Ok(InputSpec::RoomRedesigner {
                    style,
                    room_type: raw.room_type,
                    options: raw.options,
                })
            }
        }
    }

    /// Image-driven workflows need at least one uploaded reference.
    pub fn validate_references(&self, reference_count: usize) -> Result<(), SpecError> {
        match self {
            InputSpec::SmartResizer { .. } if reference_count == 0 => Err(SpecError::Invalid(
                "smart resizer requires at least one master image".into(),
            )),
            InputSpec::RoomRedesigner { .. } if reference_count == 0 => Err(SpecError::Invalid(
                "room redesigner requires at least one room image".into(),
            )),
            _ => Ok(()),
        }
    }

    pub fn options(&self) -> &GenerationOptions {
        match self {
            InputSpec::NanoBanana { options, .. }
            | InputSpec::Standard { options, .. }
            | InputSpec::SmartResizer { options, .. }
            | InputSpec::RoomRedesigner { options, .. } => options,
        }
    }
}

fn from_value<T: serde::de::DeserializeOwned>(value: &serde_json::Value) -> Result<T, SpecError> {
    serde_json::from_value(value.clone()).map_err(|e| SpecError::Invalid(e.to_string()))
}

/// What a single runner has to do for one batch index.
#[derive(Debug, Clone)]
pub enum TaskAction {
    Generate,
    Resize {
        master_url: String,
        width: u32,
        height: u32,
        format_name: String,
    },
}

#[derive(Debug, Clone)]
pub struct PromptTask {
    pub batch_index: u32,
    pub prompt: String,
    pub variant: ModelVariant,
    pub aspect_ratio: String,
    pub size: OutputSize,
    pub reference_urls: Vec<String>,
    pub action: TaskAction,
}

/// Expand a validated spec into its ordered task list.
///
/// Batch indexes are dense `[0, M)`; for the smart resizer the order is
/// master-major (`master_index * formats + format_index`).
pub fn expand(
    spec: &InputSpec,
    reference_assets: &[String],
    default_model: ModelVariant,
) -> Vec<PromptTask> {
    let options = spec.options();
    let variant = options.model.unwrap_or(default_model);
    let aspect_ratio = options
        .aspect_ratio
        .clone()
        .unwrap_or_else(|| "1:1".to_string());
    let size = options.size.unwrap_or_default();

    match spec {
        InputSpec::NanoBanana { prompts, .. } => prompts
            .iter()
            .enumerate()
            .map(|(i, prompt)| PromptTask {
                batch_index: i as u32,
                prompt: prompt.clone(),
                variant,
                aspect_ratio: aspect_ratio.clone(),
                size,
                reference_urls: reference_assets.to_vec(),
                action: TaskAction::Generate,
            })
            .collect(),

        InputSpec::Standard { prompt, .. } => vec![PromptTask {
            batch_index: 0,
            prompt: prompt.clone(),
            variant,
            aspect_ratio,
            size,
            reference_urls: reference_assets.to_vec(),
            action: TaskAction::Generate,
        }],

        InputSpec::SmartResizer { formats, .. } => {
            let mut tasks = Vec::with_capacity(reference_assets.len() * formats.len());
            for (mi, master) in reference_assets.iter().enumerate() {
                for (fi, format) in formats.iter().enumerate() {
                    tasks.push(PromptTask {
                        batch_index: (mi * formats.len() + fi) as u32,
                        prompt: format!(
                            "Resize master image {mi} to {} ({}x{})",
                            format.name, format.width, format.height
                        ),
                        variant,
                        aspect_ratio: reduced_ratio(format.width, format.height),
                        size,
                        reference_urls: vec![master.clone()],
                        action: TaskAction::Resize {
                            master_url: master.clone(),
                            width: format.width,
                            height: format.height,
                            format_name: format.name.clone(),
                        },
                    });
                }
            }
            tasks
        }

        InputSpec::RoomRedesigner {
            style, room_type, ..
        } => reference_assets
            .iter()
            .enumerate()
            .map(|(i, room)| PromptTask {
                batch_index: i as u32,
                prompt: room_prompt(style, room_type.as_deref()),
                variant,
                aspect_ratio: aspect_ratio.clone(),
                size,
                reference_urls: vec![room.clone()],
                action: TaskAction::Generate,
            })
            .collect(),
    }
}

fn room_prompt(style: &str, room_type: Option<&str>) -> String {
    let room = room_type.unwrap_or("room");
    format!(
        "Redesign this {room} in {style} style. Keep the original layout, \
         windows and lighting; replace furniture and decor to match the style."
    )
}

fn reduced_ratio(w: u32, h: u32) -> String {
    let d = gcd(w, h);
    format!("{}:{}", w / d, h / d)
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 { a } else { gcd(b, a % b) }
}
