use serde::{Deserialize, Serialize};

use super::catalog::{HairColor, Haircut, Look};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StyleSelection {
    pub haircut: Haircut,
    pub color: HairColor,
    #[serde(default)]
    pub look: Option<Look>,
}

impl Default for StyleSelection {
    fn default() -> Self {
        Self {
            haircut: Haircut::Buzzcut,
            color: HairColor::Natural,
            look: None,
        }
    }
}

/// Partial update applied by the presentation layer. `look: Some(None)` clears the look.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyleUpdate {
    #[serde(default)]
    pub haircut: Option<Haircut>,
    #[serde(default)]
    pub color: Option<HairColor>,
    #[serde(default)]
    pub look: Option<Option<Look>>,
}

impl StyleUpdate {
    pub fn haircut(haircut: Haircut) -> Self {
        Self {
            haircut: Some(haircut),
            ..Self::default()
        }
    }

    pub fn color(color: HairColor) -> Self {
        Self {
            color: Some(color),
            ..Self::default()
        }
    }

    pub fn look(look: Option<Look>) -> Self {
        Self {
            look: Some(look),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.haircut.is_none() && self.color.is_none() && self.look.is_none()
    }
}

impl StyleSelection {
    pub fn apply(&mut self, update: StyleUpdate) {
        if let Some(haircut) = update.haircut {
            self.haircut = haircut;
        }
        if let Some(color) = update.color {
            self.color = color;
        }
        if let Some(look) = update.look {
            self.look = look;
        }
    }
}
