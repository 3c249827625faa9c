use super::selection::StyleSelection;

/// Instruction for the base transform that places the uploaded subject in the salon.
pub const SALON_SEATING_INSTRUCTION: &str = "Place this person seated in a salon chair in a bright, modern hair salon, wearing a styling cape and facing the mirror. Keep their face, identity and current hairstyle unchanged. Make it photorealistic and naturally integrated.";

pub fn compose_instruction(selection: &StyleSelection) -> String {
    let mut instruction = format!(
        "Transform this person's hair with: {}. {}.",
        selection.haircut.description(),
        selection.color.description()
    );
    if let Some(look) = selection.look {
        instruction.push(' ');
        instruction.push_str(look.description());
        instruction.push('.');
    }
    instruction.push_str(" Make it photorealistic and naturally integrated.");
    instruction
}
