//! Viewpoints that can be requested for a re-rendering.
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum ViewMode {
    Aerial,
    Back,
    Bottom,
    Side,
}

impl ViewMode {
    pub const ALL: [ViewMode; 4] = [Self::Aerial, Self::Back, Self::Bottom, Self::Side];

    /// Order in which the experiments render the views of an example.
    pub const RENDER_ORDER: [ViewMode; 4] = [Self::Bottom, Self::Side, Self::Back, Self::Aerial];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Aerial => "aerial",
            Self::Back => "back",
            Self::Bottom => "bottom",
            Self::Side => "side",
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Aerial => "aerial view, ",
            Self::Back => "back view, ",
            Self::Bottom => "bottom view, ",
            Self::Side => "side view, ",
        }
    }

    /// The base prompt with this view's prefix.
    pub fn prompt(&self, base: &str) -> String {
        format!("{}{base}", self.prefix())
    }

    /// Cell of this view in a 2x3 homography sheet, in row-major order.
    pub fn sheet_index(&self) -> usize {
        match self {
            Self::Aerial => 0,
            Self::Bottom => 1,
            Self::Side => 2,
            Self::Back => 3,
        }
    }

    /// File name of the 1-based sample `index` for this view.
    pub fn sample_file_name(&self, index: usize) -> String {
        format!("{}{index}.png", self.label())
    }
}

impl fmt::Display for ViewMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ViewMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|v| v.label() == s.trim().to_lowercase())
            .ok_or_else(|| Error::invalid(format!("unknown view mode {s:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_prompts() {
        let prompt = "a coastal lighthouse with a spiral staircase.";
        assert_eq!(
            ViewMode::Aerial.prompt(prompt),
            "aerial view, a coastal lighthouse with a spiral staircase."
        );
        assert_eq!(ViewMode::Bottom.sample_file_name(3), "bottom3.png");
    }

    #[test]
    fn parse_labels() {
        assert_eq!("Side".parse::<ViewMode>().unwrap(), ViewMode::Side);
        assert!("front".parse::<ViewMode>().is_err());
        let views: Vec<ViewMode> = serde_json::from_str(r#"["back", "aerial"]"#).unwrap();
        assert_eq!(views, vec![ViewMode::Back, ViewMode::Aerial]);
        assert!(serde_json::from_str::<ViewMode>(r#""front""#).is_err());
    }
}
