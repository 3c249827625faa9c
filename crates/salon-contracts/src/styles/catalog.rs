use std::fmt;

use serde::{Deserialize, Serialize};

/// Revision of the option tables below. Bump when a description changes, since
/// descriptions flow verbatim into provider instructions.
pub const STYLE_CATALOG_VERSION: u64 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StyleOption {
    pub value: &'static str,
    pub label: &'static str,
    pub description: &'static str,
}

/// Declares one option enum together with its table. Each variant owns its row, so
/// `option()` is an exhaustive match rather than a table lookup.
macro_rules! style_category {
    (
        $(#[$meta:meta])*
        $ty:ident, $table:ident {
            $($variant:ident => ($value:literal, $label:literal, $description:literal)),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $ty {
            $($variant),+
        }

        const $table: &[StyleOption] = &[
            $(StyleOption {
                value: $value,
                label: $label,
                description: $description,
            }),+
        ];

        impl $ty {
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            pub fn options() -> &'static [StyleOption] {
                $table
            }

            pub fn option(self) -> &'static StyleOption {
                match self {
                    $($ty::$variant => &StyleOption {
                        value: $value,
                        label: $label,
                        description: $description,
                    }),+
                }
            }

            pub fn value(self) -> &'static str {
                self.option().value
            }

            pub fn label(self) -> &'static str {
                self.option().label
            }

            pub fn description(self) -> &'static str {
                self.option().description
            }

            pub fn parse(raw: &str) -> Option<Self> {
                let normalized = raw.trim().to_ascii_lowercase();
                Self::ALL
                    .iter()
                    .copied()
                    .find(|item| item.value() == normalized)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.value())
            }
        }
    };
}

style_category!(Haircut, HAIRCUT_OPTIONS {
    Buzzcut => (
        "buzzcut",
        "Buzz Cut",
        "Clean, sharp #1-3 guard all over, ultra-professional military precision cut"
    ),
    Dreadlocks => (
        "dreadlocks",
        "Dreadlocks",
        "Thick, textured rope-like locks with a natural, free-flowing bohemian style"
    ),
    Military => (
        "military",
        "Military Fade",
        "High and tight fade with longer top for a disciplined, commanding presence"
    ),
    Mullet => (
        "mullet",
        "Farmers Mullet",
        "Business front, party back in the classic working-class rebellion style"
    ),
});

style_category!(HairColor, COLOR_OPTIONS {
    Natural => (
        "natural",
        "Natural",
        "Keep the original hair color, authentic and realistic"
    ),
    Blonde => (
        "blonde",
        "Blonde",
        "Golden blonde highlights, bright and attention-grabbing"
    ),
    Ginger => (
        "ginger",
        "Ginger",
        "Rich copper-red tones, bold and distinctive"
    ),
});

style_category!(Look, LOOK_OPTIONS {
    Forbes => (
        "forbes",
        "Forbes 30 Under 30",
        "Magazine cover CEO look with a sharp suit, confident pose and executive lighting"
    ),
    Catwalk => (
        "catwalk",
        "Catwalk Model",
        "High fashion runway ready with editorial makeup and dramatic lighting"
    ),
    Redcarpet => (
        "redcarpet",
        "Red Carpet",
        "Hollywood premiere glamour with perfect styling and paparazzi-ready sophistication"
    ),
    Hbo => (
        "hbo",
        "HBO Character",
        "Prestige drama lead, an intense cinematic character with depth and gravitas"
    ),
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_maps_to_its_own_table_row() {
        for haircut in Haircut::ALL {
            assert_eq!(Haircut::parse(haircut.value()), Some(*haircut));
        }
        for color in HairColor::ALL {
            assert_eq!(HairColor::parse(color.value()), Some(*color));
        }
        for look in Look::ALL {
            assert_eq!(Look::parse(look.value()), Some(*look));
        }
        assert_eq!(Haircut::ALL.len(), Haircut::options().len());
        assert_eq!(HairColor::ALL.len(), HairColor::options().len());
        assert_eq!(Look::ALL.len(), Look::options().len());
    }

    #[test]
    fn variants_resolve_to_distinct_rows_in_declaration_order() -> anyhow::Result<()> {
        for (index, look) in Look::ALL.iter().enumerate() {
            assert_eq!(look.option(), &Look::options()[index]);
            assert_eq!(serde_json::to_string(look)?, format!("\"{}\"", look.value()));
        }
        for (index, haircut) in Haircut::ALL.iter().enumerate() {
            assert_eq!(haircut.option(), &Haircut::options()[index]);
            assert_eq!(serde_json::to_string(haircut)?, format!("\"{}\"", haircut.value()));
        }
        for (index, color) in HairColor::ALL.iter().enumerate() {
            assert_eq!(color.option(), &HairColor::options()[index]);
        }
        assert_eq!(Haircut::Mullet.label(), "Farmers Mullet");
        assert_eq!(Look::Hbo.label(), "HBO Character");
        assert_ne!(HairColor::Ginger.option(), HairColor::Natural.option());
        Ok(())
    }

    #[test]
    fn parse_is_case_insensitive_and_rejects_unknown_values() {
        assert_eq!(Haircut::parse(" BuzzCut "), Some(Haircut::Buzzcut));
        assert_eq!(Look::parse("redcarpet"), Some(Look::Redcarpet));
        assert_eq!(HairColor::parse("purple"), None);
        assert_eq!(Haircut::parse(""), None);
    }

    #[test]
    fn serde_uses_table_values() -> anyhow::Result<()> {
        assert_eq!(serde_json::to_string(&Look::Redcarpet)?, "\"redcarpet\"");
        let color: HairColor = serde_json::from_str("\"ginger\"")?;
        assert_eq!(color, HairColor::Ginger);
        Ok(())
    }
}
