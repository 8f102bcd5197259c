use crate::{
    devices::software::store::{AnalysisStore, ChatExchange},
    error::ModelError,
    messages::packet::AnalysisResult,
    utils::time::VERDICT_DATE_FORMAT,
};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use std::{fmt::Write as _, sync::Arc, time::Duration};
use tracing::{debug, info};

/// Prompt for [`JsonVerdict`]. The model is told to answer with a single
/// JSON object and to lean towards flagging danger.
pub const JSON_PROMPT: &str = r#"Analyze this image and determine if any person's actions are dangerous.
Respond with JSON only, using exactly this structure:
{
    "description": "Detailed description of the scene and any dangerous behaviors",
    "danger": true/false
}

Treat the scene as dangerous if any of the following are present:
- A person holding a weapon or any object being wielded as one (knife, gun, stick, bat).
- Physical violence or fighting.
- Fire, smoke, explosives or other hazardous materials.
- A person in immediate physical danger (near fire, in traffic, at a height).
- Machinery or vehicles operated unsafely, exposed wiring, unstable surfaces.

If unsure, mark the scene as dangerous. Only answer false when no danger at all is visible.
Your response must be valid JSON with no text outside the object."#;

/// Prompt for [`KeywordVerdict`].
pub const DESCRIBE_PROMPT: &str = "Please describe this image in detail. Focus on what people are doing, objects present, and the overall scene. Limit your description to 75 words.";

/// Free text descriptions are cut to this many words.
pub const DESCRIPTION_WORD_LIMIT: usize = 75;

/// Whole words that mark a free text description as dangerous. Matching is
/// case insensitive.
pub const HAZARD_WORDS: &[&str] = &[
    "knife", "刀", "gun", "guns", "fist", "fists", "firearm", "枪", "武器", "fight", "fighting",
    "打架", "violence", "暴力", "fire", "火焰", "smoke", "smoking", "烟雾", "danger", "危险",
    "blood", "血", "weapon", "weapons", "explosion", "爆炸", "accident", "事故",
];

/// Analyses used as chat context.
pub const CHAT_CONTEXT_RECORDS: usize = 20;

/// Context used when nothing has been analysed yet.
pub const EMPTY_CHAT_CONTEXT: &str = "No previous analysis data available.";

/// Description and verdict pulled out of a model reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub description: String,
    pub danger: bool,
}

impl Verdict {
    /// Stamp the verdict with the time its analysis was requested.
    pub fn into_result(self, requested_at: NaiveDateTime) -> AnalysisResult {
        AnalysisResult::at(requested_at, self.description, self.danger)
    }
}

/// How a verdict is derived from the model. One strategy is selected per
/// deployment.
pub trait VerdictStrategy: Send + Sync {
    /// Instruction sent with the frame.
    fn prompt(&self) -> &str;

    /// Turn the raw reply into a verdict. Anything that is not a complete
    /// verdict is an error, never a partial result.
    fn extract(&self, reply: &str) -> Result<Verdict, ModelError>;
}

/// Strategy names accepted in config.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum VerdictKind {
    /// [`JsonVerdict`].
    #[default]
    Json,
    /// [`KeywordVerdict`].
    Keywords,
}

impl VerdictKind {
    pub fn strategy(self) -> Arc<dyn VerdictStrategy> {
        match self {
            VerdictKind::Json => Arc::new(JsonVerdict),
            VerdictKind::Keywords => Arc::new(KeywordVerdict),
        }
    }
}

/// The model answers with a JSON object, possibly wrapped in other text.
/// Both fields must be present.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonVerdict;

#[derive(Deserialize)]
struct JsonReply {
    description: String,
    danger: bool,
}

impl VerdictStrategy for JsonVerdict {
    fn prompt(&self) -> &str {
        JSON_PROMPT
    }

    fn extract(&self, reply: &str) -> Result<Verdict, ModelError> {
        let object = match (reply.find('{'), reply.rfind('}')) {
            (Some(start), Some(end)) if end > start => &reply[start..=end],
            _ => return Err(ModelError::Unparsable("no JSON object in reply".to_string())),
        };
        let parsed: JsonReply =
            serde_json::from_str(object).map_err(|e| ModelError::Unparsable(e.to_string()))?;
        Ok(Verdict {
            description: parsed.description,
            danger: parsed.danger,
        })
    }
}

/// The model describes the scene in prose, danger is decided by looking
/// for hazard words in the description.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordVerdict;

impl KeywordVerdict {
    /// Whether `description` contains a hazard word as a whole word. Words
    /// are runs of letters, digits and underscores.
    pub fn is_dangerous(description: &str) -> bool {
        description
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .filter(|word| !word.is_empty())
            .any(|word| HAZARD_WORDS.contains(&word.to_lowercase().as_str()))
    }
}

impl VerdictStrategy for KeywordVerdict {
    fn prompt(&self) -> &str {
        DESCRIBE_PROMPT
    }

    fn extract(&self, reply: &str) -> Result<Verdict, ModelError> {
        let reply = reply.trim();
        if reply.is_empty() {
            return Err(ModelError::Unparsable("empty reply".to_string()));
        }
        let description = if reply.split_whitespace().count() > DESCRIPTION_WORD_LIMIT {
            reply
                .split_whitespace()
                .take(DESCRIPTION_WORD_LIMIT)
                .collect::<Vec<_>>()
                .join(" ")
        } else {
            reply.to_string()
        };
        Ok(Verdict {
            danger: Self::is_dangerous(&description),
            description,
        })
    }
}

/// Vision-model inference endpoint.
#[async_trait]
pub trait VisionModel: Send + Sync {
    /// Send one JPEG frame with an instruction, return the model's text
    /// reply untouched.
    async fn describe(&self, jpeg: &[u8], prompt: &str) -> Result<String, ModelError>;
}

#[serde_as]
#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
    #[serde_as(as = "Vec<Base64>")]
    images: Vec<&'a [u8]>,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f32,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Deserialize)]
struct ChatReplyMessage {
    content: String,
}

#[derive(Deserialize)]
struct ChatReply {
    message: ChatReplyMessage,
}

/// Ollama's non streaming chat API with an image attachment.
pub struct OllamaVision {
    client: reqwest::Client,
    chat_url: String,
    model: String,
}

impl OllamaVision {
    /// * `endpoint`: base URL of the Ollama server, e.g. `http://localhost:11434`.
    /// * `model`: model tag, e.g. `gemma3:4b`.
    /// * `timeout`: per request limit.
    pub fn new(endpoint: &str, model: &str, timeout: Duration) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            chat_url: format!("{}/api/chat", endpoint.trim_end_matches('/')),
            model: model.to_string(),
        })
    }
}

/// Map a non success status to [`ModelError::Status`].
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ModelError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ModelError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl VisionModel for OllamaVision {
    async fn describe(&self, jpeg: &[u8], prompt: &str) -> Result<String, ModelError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
                images: vec![jpeg],
            }],
            stream: false,
            options: ChatOptions { temperature: 0.0 },
        };
        info!(model = %self.model, frame_bytes = jpeg.len(), "requesting analysis");

        let response = self.client.post(&self.chat_url).json(&request).send().await?;
        let reply: ChatReply = check_status(response).await?.json().await?;
        debug!(reply = %reply.message.content, "raw model reply");
        Ok(reply.message.content)
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct CompletionReply {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

/// Answers operator questions using recent verdicts as context, through an
/// OpenAI style completions endpoint.
pub struct ChatAssistant {
    client: reqwest::Client,
    completions_url: String,
    model: String,
    store: Arc<dyn AnalysisStore>,
}

impl ChatAssistant {
    pub const MAX_TOKENS: u32 = 800;

    /// * `completions_url`: full URL of the completions route.
    /// * `model`: model tag.
    /// * `timeout`: per request limit.
    /// * `store`: history that provides context and records the exchange.
    pub fn new(
        completions_url: &str,
        model: &str,
        timeout: Duration,
        store: Arc<dyn AnalysisStore>,
    ) -> Result<Self, ModelError> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            completions_url: completions_url.to_string(),
            model: model.to_string(),
            store,
        })
    }

    /// Prompt embedding the most recent verdicts, oldest first.
    pub fn build_prompt(&self, question: &str) -> String {
        let mut context = String::new();
        for record in self
            .store
            .recent_analyses(CHAT_CONTEXT_RECORDS)
            .iter()
            .rev()
        {
            let _ = write!(
                context,
                "\n**time**: {}\n**danger**: {}\n**description**: {}\n",
                record.timestamp.format(VERDICT_DATE_FORMAT),
                if record.danger { "yes" } else { "no" },
                record.description
            );
        }
        if context.is_empty() {
            context.push_str(EMPTY_CHAT_CONTEXT);
        }

        format!(
            "You are an intelligent security monitoring assistant. Please provide an answer based on the following historical data and the user's question.\n\n\
             Historical Data:\n{context}\n\n\
             User Question:\n{question}\n\n\
             Please provide an accurate and helpful answer based on the historical data. If the question cannot be answered with the provided data, please state so clearly."
        )
    }

    /// Ask a question. The exchange is recorded in the store on success.
    pub async fn ask(&self, question: &str) -> Result<String, ModelError> {
        let prompt = self.build_prompt(question);
        let request = CompletionRequest {
            model: &self.model,
            prompt: &prompt,
            max_tokens: Self::MAX_TOKENS,
            temperature: 0.0,
        };
        info!(%question, "asking chat assistant");

        let response = self
            .client
            .post(&self.completions_url)
            .json(&request)
            .send()
            .await?;
        let reply: CompletionReply = check_status(response).await?.json().await?;
        let answer = reply
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.text.trim().to_string())
            .ok_or_else(|| ModelError::Unparsable("completion has no choices".to_string()))?;

        self.store
            .append_chat(ChatExchange::now(question, answer.clone()));
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::software::store::MemoryStore;
    use chrono::NaiveDate;
    use rstest::rstest;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        task::JoinHandle,
    };

    /// Accept one HTTP request, answer it with `status` and `body`, and
    /// hand back the raw request.
    async fn serve_once(status: &'static str, body: String) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buffer = [0u8; 4096];
            loop {
                let read = socket.read(&mut buffer).await.unwrap();
                request.extend_from_slice(&buffer[..read]);
                if let Some(end) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                    let headers = String::from_utf8_lossy(&request[..end]).to_lowercase();
                    let length = headers
                        .lines()
                        .find_map(|line| line.strip_prefix("content-length:"))
                        .and_then(|value| value.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
                if read == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&request).into_owned()
        });
        (url, handle)
    }

    #[rstest]
    #[case(r#"{"description": "two people cooking", "danger": false}"#, false)]
    #[case("Sure! Here it is:\n```json\n{\"description\": \"a man holding a knife\", \"danger\": true}\n```", true)]
    fn test_json_verdict(#[case] reply: &str, #[case] danger: bool) {
        let verdict = JsonVerdict.extract(reply).unwrap();
        assert_eq!(verdict.danger, danger);
        assert!(!verdict.description.is_empty());
    }

    #[rstest]
    #[case("I cannot analyse this image.")]
    #[case("} backwards {")]
    #[case(r#"{"description": "no verdict given"}"#)]
    #[case(r#"{"danger": true}"#)]
    #[case(r#"{"description": "x", "danger": "maybe"}"#)]
    fn test_json_verdict_rejects_incomplete(#[case] reply: &str) {
        assert!(matches!(
            JsonVerdict.extract(reply),
            Err(ModelError::Unparsable(_))
        ));
    }

    #[rstest]
    #[case("A man is holding a Knife near the door.", true)]
    #[case("Smoke is rising from the stove", true)]
    #[case("People sitting by a fireplace, reading.", false)]
    #[case("An empty office with a desk and chair.", false)]
    #[case("有人 拿着 刀", true)]
    #[case("有人拿着刀", false)]
    #[case("A knife_rack on the kitchen wall.", false)]
    #[case("Someone holds a knife, next to the knife_rack.", true)]
    fn test_keyword_verdict(#[case] reply: &str, #[case] danger: bool) {
        assert_eq!(KeywordVerdict.extract(reply).unwrap().danger, danger);
    }

    #[test]
    fn test_keyword_description_is_truncated() {
        let reply = (0..100).map(|i| format!("word{i}")).collect::<Vec<_>>().join(" ");
        let verdict = KeywordVerdict.extract(&reply).unwrap();
        assert_eq!(verdict.description.split_whitespace().count(), DESCRIPTION_WORD_LIMIT);
        assert!(verdict.description.ends_with("word74"));
        assert!(KeywordVerdict.extract("   ").is_err());
    }

    #[test]
    fn test_verdict_kind_from_yaml() {
        let kind: VerdictKind = serde_yaml::from_str("keywords").unwrap();
        assert_eq!(kind.strategy().prompt(), DESCRIBE_PROMPT);
        assert_eq!(VerdictKind::default().strategy().prompt(), JSON_PROMPT);
    }

    #[tokio::test]
    async fn test_ollama_request_and_reply() {
        let body = r#"{"model": "gemma3:4b", "message": {"role": "assistant", "content": "{\"description\": \"empty room\", \"danger\": false}"}, "done": true}"#;
        let (url, server) = serve_once("200 OK", body.to_string()).await;

        let vision = OllamaVision::new(&url, "gemma3:4b", Duration::from_secs(5)).unwrap();
        let reply = vision.describe(&[1, 2, 3], JSON_PROMPT).await.unwrap();
        assert_eq!(
            JsonVerdict.extract(&reply).unwrap(),
            Verdict {
                description: "empty room".to_string(),
                danger: false
            }
        );

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/chat"));
        assert!(request.contains(r#""images":["AQID"]"#));
        assert!(request.contains(r#""stream":false"#));
    }

    #[tokio::test]
    async fn test_ollama_error_status() {
        let (url, server) = serve_once("404 Not Found", r#"{"error": "model not found"}"#.to_string()).await;
        let vision = OllamaVision::new(&url, "missing", Duration::from_secs(5)).unwrap();
        match vision.describe(&[0], JSON_PROMPT).await {
            Err(ModelError::Status { status, body }) => {
                assert_eq!(status, 404);
                assert!(body.contains("model not found"));
            }
            other => panic!("unexpected {other:?}"),
        }
        server.await.unwrap();
    }

    fn store_with_history() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new(64));
        for (second, danger) in [(1, false), (2, true)] {
            store.append_analysis(AnalysisResult {
                timestamp: NaiveDate::from_ymd_opt(2024, 5, 1)
                    .unwrap()
                    .and_hms_opt(9, 0, second)
                    .unwrap(),
                description: format!("scene {second}"),
                danger,
            });
        }
        store
    }

    #[test]
    fn test_chat_prompt_context() {
        let empty = ChatAssistant::new(
            "http://localhost:1/v1/completions",
            "gemma3:4b",
            Duration::from_secs(1),
            Arc::new(MemoryStore::new(8)),
        )
        .unwrap();
        assert!(empty.build_prompt("hello").contains(EMPTY_CHAT_CONTEXT));

        let chat = ChatAssistant::new(
            "http://localhost:1/v1/completions",
            "gemma3:4b",
            Duration::from_secs(1),
            store_with_history(),
        )
        .unwrap();
        let prompt = chat.build_prompt("was anything dangerous?");
        let first = prompt.find("scene 1").unwrap();
        let second = prompt.find("scene 2").unwrap();
        assert!(first < second, "context must be oldest first");
        assert!(prompt.contains("**time**: 2024-05-01 09:00:02\n**danger**: yes"));
        assert!(prompt.contains("User Question:\nwas anything dangerous?"));
    }

    #[tokio::test]
    async fn test_chat_answer_is_recorded() {
        let body = r#"{"choices": [{"text": "  One dangerous event at 09:00:02.\n"}]}"#;
        let (url, server) = serve_once("200 OK", body.to_string()).await;
        let store = store_with_history();
        let chat = ChatAssistant::new(
            &format!("{url}/v1/completions"),
            "gemma3:4b",
            Duration::from_secs(5),
            store.clone(),
        )
        .unwrap();

        let answer = chat.ask("was anything dangerous?").await.unwrap();
        assert_eq!(answer, "One dangerous event at 09:00:02.");
        assert_eq!(store.recent_chats(1)[0].answer, answer);

        let request = server.await.unwrap();
        assert!(request.contains(r#""max_tokens":800"#));
    }

    #[tokio::test]
    #[cfg_attr(not(feature = "model_test"), ignore)]
    async fn test_live_model_verdict() {
        let frame = image::DynamicImage::new_rgb8(64, 64);
        let jpeg = crate::utils::image::encode_jpeg(&frame, crate::utils::image::JpegQuality::ANALYSIS)
            .unwrap();
        let vision =
            OllamaVision::new("http://localhost:11434", "gemma3:4b", Duration::from_secs(60))
                .unwrap();
        let reply = vision.describe(&jpeg, JSON_PROMPT).await.unwrap();
        JsonVerdict.extract(&reply).unwrap();
    }
}
