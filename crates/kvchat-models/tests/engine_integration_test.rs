//! Integration tests driving engines through the factory and catalog.

use kvchat_abstraction::{EngineParams, LanguageEngine, SamplingParams};
use kvchat_models::{EngineFactory, ModelCatalog};
use tempfile::TempDir;

const CORPUS: &str = "Question: what colour is the sky?\nAnswer: blue\n\n\
                      Question: what colour is grass?\nAnswer: green";

fn generate(engine: &mut dyn LanguageEngine, prompt: &str, max_tokens: u32) -> String {
    let tokens = engine.tokenize(prompt.as_bytes()).unwrap();
    engine.eval(&tokens).unwrap();
    let params = SamplingParams { temperature: 0.0, max_tokens, seed: None };
    let mut out = Vec::new();
    for _ in 0..max_tokens {
        let token = engine.sample(&params).unwrap();
        if token == engine.token_eos() {
            break;
        }
        engine.eval(&[token]).unwrap();
        out.push(token);
    }
    String::from_utf8(engine.detokenize(&out).unwrap()).unwrap()
}

#[test]
fn test_catalog_model_loads_through_factory() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("tiny-ngram-4k.ngram"), CORPUS).unwrap();
    let catalog = ModelCatalog::load(dir.path(), None).unwrap();
    let model = catalog.get("tiny-ngram-4k").unwrap();

    let loader = EngineFactory::loader(model.kind);
    let params = EngineParams::default().with_context_size(1024);
    let mut engine = loader.load(&model.descriptor, &params).unwrap();

    let answer = generate(engine.as_mut(), "Question: what colour is the sky?\nAnswer: ", 32);
    assert_eq!(answer, "blue");
}

#[test]
fn test_saved_state_resumes_on_fresh_instance() {
    let dir = TempDir::new().unwrap();
    let weights = dir.path().join("tiny-ngram-4k.ngram");
    std::fs::write(&weights, CORPUS).unwrap();
    let catalog = ModelCatalog::load(dir.path(), None).unwrap();
    let model = catalog.get("tiny-ngram-4k").unwrap();
    let loader = EngineFactory::loader(model.kind);
    let params = EngineParams::default().with_context_size(2048);

    let mut primed = loader.load(&model.descriptor, &params).unwrap();
    let doc = primed.tokenize(b"The secret word is xylophone.").unwrap();
    primed.eval(&doc).unwrap();
    let state_path = dir.path().join("doc.kvcache");
    primed.save_state_to(&state_path).unwrap();

    let mut fresh = loader.load(&model.descriptor, &params).unwrap();
    fresh.load_state_from(&state_path).unwrap();
    assert_eq!(fresh.n_tokens(), doc.len());

    let answer = generate(fresh.as_mut(), " The secret word is x", 8);
    assert!(answer.starts_with("ylo"), "unexpected continuation: {answer}");
}
