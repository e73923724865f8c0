//! Prompt templates for generator-backed stages.

/// Ask for an English rendering of `text`.
pub fn translation_prompt(text: &str) -> String {
    format!(
        "Translate the following text into English. If it is already in English, \
return it unchanged. Reply with the translated text only: no preface, no notes, \
no quotation marks.

Text:
{text}"
    )
}

/// Ask for a single comforting sentence phrased like a verse that addresses
/// `issue`. The reply is used as the retrieval query, so it should read like
/// the corpus rather than like the user.
pub fn therapy_prompt(issue: &str) -> String {
    format!(
        "You are a compassionate counsellor. Answer the user's problem with one concise \
sentence that comforts them and speaks to their issue. The sentence must be the English \
translation of a Quran verse that addresses the issue.
Do not write anything before the sentence.
Do not introduce it (for example with \"Here is the sentence:\").
Do not write anything after the sentence.
Reply with the sentence only.

User issue:
{issue}"
    )
}
