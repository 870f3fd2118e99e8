use narration_core::EmotionalDirective;

/// Stage of the narration's emotional arc for a position in [0, 1].
pub fn arc_stage(position: f32) -> &'static str {
    match position {
        p if p < 0.2 => "opening: greet gently, make the listener feel welcome and understood",
        p if p < 0.4 => "empathy: acknowledge the feelings without judgement",
        p if p < 0.6 => "deepening: slow down, invite reflection",
        p if p < 0.8 => "transformation: offer a new perspective with quiet confidence",
        _ => "hope: close with warmth and encouragement",
    }
}

/// Audio-profile prompt wrapping the transcript with director's notes.
pub fn build_prompt(text: &str, directive: &EmotionalDirective) -> String {
    let breathing = if directive.breathing.trim().is_empty() {
        "leave a natural breathing space after every sentence"
    } else {
        directive.breathing.as_str()
    };

    format!(
        "# AUDIO PROFILE: Healing Voice Guide\n\
         \n\
         ## THE SCENE:\n\
         A quiet, softly lit room. The listener feels safe and accepted.\n\
         \n\
         ### DIRECTOR'S NOTES\n\
         \n\
         **Style:** {style}\n\
         \n\
         **Pacing:** {pacing}\n\
         \n\
         **Breathing:** {breathing}\n\
         \n\
         **Emotional Arc:** {arc}\n\
         \n\
         **Voice Quality:** warm, low but clear, sincere; never theatrical\n\
         \n\
         ## TRANSCRIPT:\n\
         {text}\n",
        style = directive.style,
        pacing = directive.pacing,
        arc = arc_stage(directive.arc_position),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arc_stage_boundaries() {
        assert!(arc_stage(0.0).starts_with("opening"));
        assert!(arc_stage(0.5).starts_with("deepening"));
        assert!(arc_stage(1.0).starts_with("hope"));
    }

    #[test]
    fn test_prompt_carries_directive_and_transcript() {
        let directive = EmotionalDirective {
            style: "soft and reassuring".into(),
            pacing: "very slow".into(),
            breathing: String::new(),
            arc_position: 0.7,
        };
        let prompt = build_prompt("You are safe here.", &directive);
        assert!(prompt.contains("**Style:** soft and reassuring"));
        assert!(prompt.contains("**Pacing:** very slow"));
        assert!(prompt.contains("natural breathing space"));
        assert!(prompt.contains("transformation"));
        assert!(prompt.trim_end().ends_with("You are safe here."));
    }
}
