use std::sync::Arc;

use crate::config::AppConfig;
use crate::error::AppResult;
use crate::llm::LlmClient;
use crate::pipeline::Pipeline;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<Store>,
    pub llm: Arc<LlmClient>,
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(config: AppConfig) -> AppResult<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(config.tmp_dir())?;

        let store = Arc::new(Store::open(&config.db_path())?);
        // Warm the brute-force search cache from persisted blobs.
        store.load_vectors()?;

        let llm = Arc::new(LlmClient::new(
            &config.lm_studio_url,
            config.llm_timeout_secs,
        )?);
        let pipeline = Arc::new(Pipeline::new(store.clone(), llm.clone(), config.clone()));

        Ok(Self {
            config,
            store,
            llm,
            pipeline,
        })
    }
}
