//! Worker-side fan-out client.
//!
//! Inference workers run one cache server per host; every update must
//! reach all of them. Endpoints are discovered once from an environment
//! variable listing bracketed IPv6 `[addr]:port` entries, then each
//! update request is dispatched to every endpoint concurrently. A failing
//! endpoint is logged and skipped; the rest of the fleet still receives
//! the update.
//!
//! The client also remembers, per prompt hash, how much of the prompt was
//! already uploaded and sends only the new tail on later calls. This is a
//! wire-size optimization only: the server rebuilds a fresh tree from
//! whatever arrives in one request.

use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

use regex::Regex;
use tonic::transport::{Channel, Endpoint};

use specache_core::prompt_hash;

use crate::proto::suffix_cache_service_client::SuffixCacheServiceClient;
use crate::proto::{TokenList, UpdateCacheRequest};

/// Port every per-host cache server listens on.
pub const DEFAULT_PORT: u16 = 6378;

/// Environment variable listing the worker hosts of the fleet.
pub const WORKER_HOSTS_ENV: &str = "SPECACHE_WORKER_HOSTS";

fn host_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\[([\da-f:]+)\]:\d+").expect("static host pattern compiles")
    })
}

/// Extract unique cache endpoints from the raw environment value.
///
/// Host addresses are deduplicated and re-paired with `port`; an unset or
/// unmatched value falls back to a single localhost endpoint.
pub fn endpoints_from_env(raw: Option<&str>, port: u16) -> Vec<String> {
    let Some(raw) = raw else {
        return vec![format!("localhost:{port}")];
    };
    let unique: BTreeSet<String> = host_pattern()
        .captures_iter(raw)
        .map(|cap| cap[1].to_string())
        .collect();
    if unique.is_empty() {
        return vec![format!("localhost:{port}")];
    }
    unique
        .into_iter()
        .map(|addr| format!("[{addr}]:{port}"))
        .collect()
}

pub struct CacheUpdateClient {
    endpoints: Vec<String>,
    channels: Vec<Channel>,
    /// Greatest prompt length already uploaded, per prompt hash.
    uploaded_prompt_len: HashMap<u64, usize>,
}

impl CacheUpdateClient {
    /// Discover endpoints from [`WORKER_HOSTS_ENV`] and connect lazily.
    pub fn from_env() -> Result<Self, tonic::transport::Error> {
        let raw = std::env::var(WORKER_HOSTS_ENV).ok();
        Self::new(endpoints_from_env(raw.as_deref(), DEFAULT_PORT))
    }

    /// Connect (lazily) to an explicit endpoint list.
    pub fn new(endpoints: Vec<String>) -> Result<Self, tonic::transport::Error> {
        let mut channels = Vec::with_capacity(endpoints.len());
        for endpoint in &endpoints {
            let channel = Endpoint::from_shared(format!("http://{endpoint}"))?.connect_lazy();
            channels.push(channel);
            tracing::info!(endpoint = %endpoint, "cache endpoint registered");
        }
        Ok(Self {
            endpoints,
            channels,
            uploaded_prompt_len: HashMap::new(),
        })
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Upload sampled responses for a batch of prompts.
    ///
    /// `responses` holds `responses_per_prompt` consecutive entries per
    /// prompt; `prompt_lengths` / `response_lengths` give the unpadded
    /// lengths within the (possibly padded) token rows. One request is
    /// built per prompt group and sent to every endpoint.
    pub async fn update_response_cache(
        &mut self,
        prompts: &[Vec<i32>],
        responses: &[Vec<i32>],
        prompt_lengths: &[usize],
        response_lengths: &[usize],
        responses_per_prompt: usize,
    ) {
        if responses_per_prompt == 0 || prompts.is_empty() {
            tracing::warn!("response cache update with no prompts or zero group size");
            return;
        }
        let requests = self.build_response_requests(
            prompts,
            responses,
            prompt_lengths,
            response_lengths,
            responses_per_prompt,
        );
        self.fan_out(&requests).await;
    }

    /// Warm the cache with prompt-only trees before any rollout runs.
    pub async fn update_prompt_cache(&mut self, prompts: &[Vec<i32>], prompt_lengths: &[usize]) {
        if prompts.is_empty() || prompts.len() != prompt_lengths.len() {
            tracing::warn!(
                prompts = prompts.len(),
                lengths = prompt_lengths.len(),
                "prompt cache update with mismatched inputs"
            );
            return;
        }
        let requests: Vec<UpdateCacheRequest> = prompts
            .iter()
            .zip(prompt_lengths)
            .map(|(prompt, &len)| {
                let tail = unpadded_tail(prompt, len);
                UpdateCacheRequest {
                    prompt_hash: prompt_hash(tail),
                    prompt: Some(TokenList {
                        tokens: tail.to_vec(),
                    }),
                    responses: Vec::new(),
                }
            })
            .collect();
        self.fan_out(&requests).await;
    }

    fn build_response_requests(
        &mut self,
        prompts: &[Vec<i32>],
        responses: &[Vec<i32>],
        prompt_lengths: &[usize],
        response_lengths: &[usize],
        responses_per_prompt: usize,
    ) -> Vec<UpdateCacheRequest> {
        let prompts_num = responses.len() / responses_per_prompt;
        let mut requests = Vec::with_capacity(prompts_num);

        for i in 0..prompts_num {
            let prompt_idx = i * responses_per_prompt;
            let prompt = &prompts[prompt_idx];
            let prompt_len = prompt_lengths[prompt_idx].min(prompt.len());
            let hash = prompt_hash(unpadded_tail(prompt, prompt_len));

            // Incremental upload: skip the part of the row that this
            // prompt family has already received.
            let uploaded = self.uploaded_prompt_len.get(&hash).copied().unwrap_or(0);
            let start_idx = uploaded.min(prompt.len() - prompt_len);

            let mut request = UpdateCacheRequest {
                prompt_hash: hash,
                prompt: Some(TokenList {
                    tokens: prompt[start_idx..].to_vec(),
                }),
                responses: Vec::with_capacity(responses_per_prompt),
            };
            for j in 0..responses_per_prompt {
                let resp_idx = prompt_idx + j;
                let resp_len = response_lengths[resp_idx].min(responses[resp_idx].len());
                request.responses.push(TokenList {
                    tokens: responses[resp_idx][..resp_len].to_vec(),
                });
            }
            self.uploaded_prompt_len.insert(hash, prompt.len());
            requests.push(request);
        }
        requests
    }

    /// Send every request to every endpoint concurrently and wait for all
    /// (request × endpoint) completions. Failures are logged per
    /// endpoint; the batch itself never fails.
    async fn fan_out(&self, requests: &[UpdateCacheRequest]) {
        let mut calls = Vec::with_capacity(requests.len() * self.channels.len());
        for (req_idx, request) in requests.iter().enumerate() {
            for (endpoint, channel) in self.endpoints.iter().zip(&self.channels) {
                let mut client = SuffixCacheServiceClient::new(channel.clone());
                let request = request.clone();
                calls.push(async move {
                    let outcome = client.update_cache(request).await;
                    (req_idx, endpoint, outcome)
                });
            }
        }
        for (req_idx, endpoint, outcome) in futures::future::join_all(calls).await {
            match outcome {
                Ok(response) if response.get_ref().success => {}
                Ok(_) => {
                    tracing::warn!(endpoint = %endpoint, request = req_idx, "cache server rejected update");
                }
                Err(status) => {
                    tracing::warn!(
                        endpoint = %endpoint,
                        request = req_idx,
                        error = %status,
                        "cache update rpc failed"
                    );
                }
            }
        }
    }
}

/// The last `len` tokens of a (left-padded) prompt row.
fn unpadded_tail(prompt: &[i32], len: usize) -> &[i32] {
    let len = len.min(prompt.len());
    &prompt[prompt.len() - len..]
}
