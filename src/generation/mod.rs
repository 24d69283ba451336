//! Streaming generation pipeline (spec §4.6, §4.7): turns a message list and
//! options into either a final string or an ordered sequence of chunks,
//! detokenizing the cumulative token sequence on every step so multi-byte
//! glyphs resolve correctly, and bridging tool calls back to the controller.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::backend::InferenceBackend;
use crate::error::{CoreError, CoreResult};
use crate::registry::ModelRegistry;
use crate::session::SessionManager;
use crate::types::{ChatMessage, GenerationOptions, GenerationResult, StopReason, ToolDescriptor};

/// 5s timeout for tool discovery, 30s for execution (spec §4.7).
pub const TOOL_LIST_TIMEOUT: Duration = Duration::from_secs(5);
pub const TOOL_EXECUTE_TIMEOUT: Duration = Duration::from_secs(30);

/// The reverse-bridge seam the worker's envelope loop implements: posting
/// `mcpToolsRequest`/`executeMCPTool` upstream and awaiting the matching
/// controller replies (spec §4.7). Synchronous/blocking by design, matching
/// the teacher's worker loop, which is itself not end-to-end async.
pub trait ToolBridge: Send + Sync {
    fn discover_tools(&self) -> CoreResult<Vec<ToolDescriptor>>;
    fn execute_tool(&self, tool: &str, params: serde_json::Value) -> CoreResult<serde_json::Value>;
}

pub struct ResponseGenerator {
    backend: Arc<dyn InferenceBackend>,
    registry: Arc<ModelRegistry>,
    sessions: Arc<SessionManager>,
}

impl ResponseGenerator {
    pub fn new(backend: Arc<dyn InferenceBackend>, registry: Arc<ModelRegistry>, sessions: Arc<SessionManager>) -> Self {
        Self { backend, registry, sessions }
    }

    /// Message-to-prompt reduction (spec §4.6): the first `role=="user"`
    /// entry scanning in reverse is the prompt.
    fn reduce_to_prompt(messages: &[ChatMessage]) -> CoreResult<&str> {
        messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .ok_or(CoreError::NoUserMessage)
    }

    /// Non-streaming path (spec §4.6 steps 1-6).
    pub fn generate(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        options: &GenerationOptions,
        cancel: CancellationToken,
        tool_bridge: Option<&dyn ToolBridge>,
    ) -> CoreResult<GenerationResult> {
        let mut content = String::new();
        let stop_reason = self.run(model_id, messages, options, cancel, tool_bridge, &mut |chunk| content.push_str(chunk))?;

        if stop_reason == StopReason::Abort {
            // Step 6: abort is translated to an empty result, not propagated.
            return Ok(GenerationResult { content: String::new(), tokens_generated: 0, stop_reason: StopReason::Abort });
        }

        self.record_reply(model_id, &content, options.disable_chat_history);

        // Step 5: length-as-token approximation is a documented limitation.
        let tokens_generated = content.chars().count() as u64;
        self.registry.record_prompt_usage(model_id, tokens_generated);
        Ok(GenerationResult { content, tokens_generated, stop_reason })
    }

    /// Streaming path: same preamble as `generate`, but `on_chunk` receives
    /// only the newly produced suffix of each cumulative detokenization
    /// (spec §4.6's "must detokenize the cumulative sequence on every
    /// callback and emit only the new suffix").
    pub fn generate_stream(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        options: &GenerationOptions,
        cancel: CancellationToken,
        tool_bridge: Option<&dyn ToolBridge>,
        on_chunk: &mut dyn FnMut(&str),
    ) -> CoreResult<GenerationResult> {
        let mut content = String::new();
        let stop_reason = self.run(model_id, messages, options, cancel, tool_bridge, &mut |chunk| {
            content.push_str(chunk);
            on_chunk(chunk);
        })?;

        if stop_reason == StopReason::Abort {
            return Ok(GenerationResult { content: String::new(), tokens_generated: 0, stop_reason: StopReason::Abort });
        }

        self.record_reply(model_id, &content, options.disable_chat_history);

        let tokens_generated = content.chars().count() as u64;
        self.registry.record_prompt_usage(model_id, tokens_generated);
        Ok(GenerationResult { content, tokens_generated, stop_reason })
    }

    fn run(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        options: &GenerationOptions,
        cancel: CancellationToken,
        tool_bridge: Option<&dyn ToolBridge>,
        on_chunk: &mut dyn FnMut(&str),
    ) -> CoreResult<StopReason> {
        let prompt = Self::reduce_to_prompt(messages)?.to_string();

        // Step 1: fetch tools over the reverse bridge unless disabled,
        // cached for the duration of this call.
        let _tools: Vec<ToolDescriptor> = if !options.disable_functions {
            match tool_bridge {
                Some(bridge) => bridge.discover_tools()?,
                None => Vec::new(),
            }
        } else {
            Vec::new()
        };

        if !self.registry.is_active(model_id) {
            return Err(CoreError::NotLoaded(model_id.to_string()));
        }

        let session_id = SessionManager::session_id_for(model_id);

        // Step 2: snapshot history before prompting when disableChatHistory.
        let history_snapshot =
            if options.disable_chat_history { Some(self.sessions.snapshot(&session_id)) } else { None };

        self.sessions.append(&session_id, ChatMessage { role: "user".into(), content: prompt.clone() });

        // Step 3: invoke the backend, detokenizing the cumulative token
        // sequence on every callback and emitting only the new suffix.
        let stop_reason = self
            .registry
            .with_runtime_info(model_id, |info| -> CoreResult<StopReason> {
                let mut tokens: Vec<u32> = Vec::new();
                let mut previous = String::new();
                self.backend.generate_tokens(&info.session, &prompt, options, &cancel, &mut |token| {
                    tokens.push(token);
                    let full_text = self.backend.detokenize(&info.session, &tokens);
                    if full_text.len() > previous.len() {
                        on_chunk(&full_text[previous.len()..]);
                        previous = full_text;
                    }
                })
            })
            .ok_or_else(|| CoreError::NotLoaded(model_id.to_string()))??;

        self.registry.touch(model_id);

        // Step 4: restore the snapshot if one was taken; otherwise persist
        // this turn's assistant reply.
        match history_snapshot {
            Some(snapshot) => self.sessions.restore(&session_id, snapshot),
            None => {
                // The reply text is whatever `on_chunk` accumulated upstream;
                // callers (`generate`/`generate_stream`) own that buffer, so
                // history persistence of the assistant turn happens there
                // via `record_reply`.
            }
        }

        Ok(stop_reason)
    }

    /// Persist the assistant's reply into session history. Called by
    /// `generate`/`generate_stream` after a successful, non-abort turn whose
    /// history was not already discarded by `disableChatHistory`.
    fn record_reply(&self, model_id: &str, reply: &str, disable_chat_history: bool) {
        if disable_chat_history {
            return;
        }
        let session_id = SessionManager::session_id_for(model_id);
        self.sessions.append(&session_id, ChatMessage { role: "assistant".into(), content: reply.to_string() });
    }
}
