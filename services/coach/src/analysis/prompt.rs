//! Coaching prompts.

/// Instruction sent once in the streaming session setup.
pub const SYSTEM_INSTRUCTION: &str = "\
You are a basketball shooting coach watching a player practise. For every \
shot you are shown, decide whether it went in and give one short, specific \
coaching tip about the player's form.

Reply with a single JSON object and nothing else:
{\"outcome\": \"make\" or \"miss\", \"tip\": \"coaching tip, at most 10 words\"}

Look at elbow alignment, follow-through, knee bend, balance and arc. Be \
direct and encouraging.";

const SHOT_PROMPT: &str = "\
Analyse this basketball shot. The first image is the release, the last image \
is the ball reaching the hoop.
1. Outcome: make or miss (did the ball go through the hoop?)
2. One specific coaching tip about shooting form, at most 10 words";

const FORMAT_INSTRUCTIONS: &str = "

Return JSON only:
{\"outcome\": \"make\" or \"miss\", \"tip\": \"your coaching tip\"}";

/// Build the per-shot prompt.
///
/// When `last_tip` is non-empty the service is asked not to repeat it.
pub fn shot_prompt(last_tip: &str) -> String {
    let mut prompt = String::from(SHOT_PROMPT);
    let last_tip = last_tip.trim();
    if !last_tip.is_empty() {
        prompt.push_str(&format!("\n- Don't repeat this previous tip: '{}'", last_tip));
    }
    prompt.push_str(FORMAT_INSTRUCTIONS);
    prompt
}
