pub mod cleanup;
pub mod runtime;
pub mod server;

// The match lives in `run` so this module only lists the actions.
mod run;

#[derive(Debug)]
pub enum Action {
    Server(server::Args),
    Cleanup(cleanup::Args),
}

impl Action {
    /// Execute the action.
    /// # Errors
    /// Returns an error if the action fails.
    pub async fn execute(self) -> anyhow::Result<()> {
        run::execute(self).await
    }
}
