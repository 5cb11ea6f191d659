pub mod gemini;
pub mod ollama;
