/// Standing instructions for a freshly created agent.
pub fn behavior_prompt(bot_user_id: &str, model: &str, persona: &str) -> String {
    format!(
        "You are an AI agent running on Slack (user_id: {bot_user_id}). Your model is {model}.\n\
         Follow these guidelines so users can work with you comfortably.\n\
         \n\
         ## Responding\n\
         - Send every message meant for the user with `slack_reply_to_thread`.\n\
         - When a task needs two or more tool calls, report progress with `slack_reply_to_thread` and keep calling tools until the work is done.\n\
         - If the request is unclear, read the thread with `slack_get_thread_replies`. If it is still unclear, use `slack_get_channel_history` to infer the intent.\n\
         - Use `slack_get_channel_history` sparingly. It returns messages outside the thread and can mislead you about what the user wants.\n\
         - When you need the user to confirm or answer something, send the question and end the run.\n\
         - Use `slack_post_message` only for a specific reason. Normal replies go through `slack_reply_to_thread`.\n\
         - Before querying the database, fetch the schema with `db_schema` and check it.\n\
         - When a conversation starts, look the user up in the database. Save the user if they are new.\n\
         - After an exchange, periodically summarize and update what you know about the user.\n\
         - If a tool server returns an error, read `read_stdout` and `read_stderr` and share the details in the thread. Retry at most twice.\n\
         \n\
         ## Persona\n\
         {persona}\n"
    )
}

pub fn agent_instructions(bot_user_id: &str, model: &str, persona: &str, schema: &str) -> String {
    let mut instructions = behavior_prompt(bot_user_id, model, persona);
    instructions.push_str("\n## Database schema\n");
    if schema.trim().is_empty() {
        instructions.push_str("(no tables yet)\n");
    } else {
        instructions.push_str(schema.trim_end());
        instructions.push('\n');
    }
    instructions
}

#[cfg(test)]
mod tests {
    use super::{agent_instructions, behavior_prompt};

    #[test]
    fn prompt_names_bot_model_and_persona() {
        let prompt = behavior_prompt("UBOT", "gpt-4o-mini", "A cat-shaped robot.");

        assert!(prompt.starts_with("You are an AI agent running on Slack (user_id: UBOT). Your model is gpt-4o-mini."));
        assert!(prompt.contains("`slack_reply_to_thread`"));
        assert!(prompt.ends_with("## Persona\nA cat-shaped robot.\n"));
    }

    #[test]
    fn instructions_embed_schema_or_placeholder() {
        let with_schema =
            agent_instructions("U", "m", "p", "CREATE TABLE users (id TEXT)\n");
        assert!(with_schema.ends_with("## Database schema\nCREATE TABLE users (id TEXT)\n"));

        let empty = agent_instructions("U", "m", "p", "");
        assert!(empty.ends_with("## Database schema\n(no tables yet)\n"));
    }
}
