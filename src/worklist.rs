//! Examples to process, either built in or read from a JSON file.
use crate::error::{Error, Result};
use crate::view::ViewMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where the starting image of a rendering comes from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum Homography {
    /// The same image for every view.
    Single(PathBuf),
    /// One image per view, `{dir}/{example}_{view}.png`.
    PerView(PathBuf),
    /// A 2x3 sheet holding the aerial, bottom, side and back guesses.
    Sheet(PathBuf),
    /// Start from the source image itself.
    #[default]
    None,
}

impl Homography {
    /// The file to read for some view of an example, `None` for the source image.
    pub fn path(&self, example_id: &str, view: ViewMode) -> Option<PathBuf> {
        match self {
            Self::Single(path) | Self::Sheet(path) => Some(path.clone()),
            Self::PerView(dir) => Some(dir.join(format!("{example_id}_{}.png", view.label()))),
            Self::None => None,
        }
    }
}

fn default_view_modes() -> Vec<ViewMode> {
    ViewMode::RENDER_ORDER.to_vec()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
    pub id: String,
    pub image: PathBuf,
    pub prompt: String,
    #[serde(default = "default_view_modes")]
    pub view_modes: Vec<ViewMode>,
    #[serde(default)]
    pub homography: Homography,
}

impl Example {
    pub fn new<S: Into<String>, P: Into<PathBuf>>(id: S, image: P, prompt: S) -> Self {
        Self {
            id: id.into(),
            image: image.into(),
            prompt: prompt.into(),
            view_modes: default_view_modes(),
            homography: Homography::None,
        }
    }

    pub fn with_homography(mut self, homography: Homography) -> Self {
        self.homography = homography;
        self
    }

    pub fn with_view_modes(mut self, view_modes: Vec<ViewMode>) -> Self {
        self.view_modes = view_modes;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() || self.id.contains(['/', '\\']) {
            return Err(Error::invalid(format!("bad example id {:?}", self.id)));
        }
        if self.prompt.trim().is_empty() {
            return Err(Error::invalid(format!("example {} has an empty prompt", self.id)));
        }
        if self.view_modes.is_empty() {
            return Err(Error::invalid(format!("example {} has no view mode", self.id)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worklist {
    pub examples: Vec<Example>,
}

// The synthetic images of the experiments and their prompts.
const SYNTHETIC: [(&str, &str); 16] = [
    ("birdanimal1", "A fluffy baby penguin learning to waddle."),
    ("animation4", "A young wizard learning to control their powers."),
    ("animation3", "A magical forest where animals talk."),
    ("architectures8", "A modern museum with white walls and glass ceilings."),
    ("architectures23", "A futuristic cityscape with towering buildings."),
    ("architectures34", "A coastal lighthouse with a spiral staircase."),
    ("birdanimal38", "A group of goslings following their parent."),
    ("city27", "A bustling city street during a summer festival."),
    ("human8", "A scientist working in a laboratory."),
    ("human81", "A teacher inspiring students with a captivating lesson."),
    (
        "indoor2",
        "A modern living room with a large TV, a glass coffee table, and leather chairs, with a view of a city skyline.",
    ),
    ("indoor44", "An upscale clothing boutique with designer labels."),
    ("nature16", "A cave with sparkling stalagmites and stalactites."),
    ("nature18", "A beach with black sand and dramatic rock formations."),
    ("traffic24", "An airport with planes taking off and landing."),
    ("traffic10", "A motorcycle lane with motorcycles riding by."),
];

impl Worklist {
    pub fn new(examples: Vec<Example>) -> Result<Self> {
        let worklist = Self { examples };
        worklist.validate()?;
        Ok(worklist)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let worklist: Self = crate::config::load_json(path).map_err(|e| match e {
            Error::Config(e) => Error::invalid(format!("worklist {path:?}: {e}")),
            e => e,
        })?;
        worklist.validate()?;
        Ok(worklist)
    }

    /// The built-in experiment list: `{dataset_root}/{id}.png` with the
    /// homography guess `{zero_root}/output{id}.png`.
    pub fn synthetic<P: AsRef<Path>, Q: AsRef<Path>>(dataset_root: P, zero_root: Q) -> Self {
        let examples = SYNTHETIC
            .iter()
            .map(|(id, prompt)| {
                Example::new(*id, dataset_root.as_ref().join(format!("{id}.png")), *prompt)
                    .with_homography(Homography::Single(
                        zero_root.as_ref().join(format!("output{id}.png")),
                    ))
            })
            .collect();
        Self { examples }
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.examples.iter().map(|e| e.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    fn validate(&self) -> Result<()> {
        for (index, example) in self.examples.iter().enumerate() {
            example.validate()?;
            if self.examples[..index].iter().any(|e| e.id == example.id) {
                return Err(Error::invalid(format!("duplicate example id {}", example.id)));
            }
        }
        Ok(())
    }
}
