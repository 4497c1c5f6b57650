use dagforge_core::delegate::DelegateRequest;

/// Build the instruction string passed to any concrete delegate backend.
///
/// Composes the requested task, optional extra instructions, any attached
/// context files, and extra context the caller supplied. All backends use
/// this so the prompt format stays consistent across them.
pub fn build_instruction(request: &DelegateRequest) -> String {
    let mut s = String::new();

    s.push_str(&request.task);

    if let Some(instructions) = request.instructions.as_deref().filter(|i| !i.is_empty()) {
        s.push_str("\n\n---\n\n");
        s.push_str(instructions);
    }

    if !request.context_files.is_empty() {
        s.push_str("\n\n---\n\nRelevant files:\n");
        for file in &request.context_files {
            s.push_str(&format!("- {}\n", file.display()));
        }
    }

    if let Some(extra) = request.extra_context.as_deref().filter(|c| !c.is_empty()) {
        s.push_str("\n\n---\n\n");
        s.push_str(extra);
    }

    s
}
