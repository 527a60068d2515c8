//! A mockito server standing in for a third-party API.

use mockito::{Mock, Server, ServerGuard};

pub struct UpstreamMock {
    server: ServerGuard,
    mocks: Vec<Mock>,
}

impl UpstreamMock {
    pub async fn new() -> Self {
        Self { server: Server::new_async().await, mocks: Vec::new() }
    }

    #[must_use]
    pub fn url(&self) -> String {
        self.server.url()
    }

    /// `GET path` answers 200 with a JSON body, expected exactly `hits` times.
    pub async fn json(&mut self, path: &str, body: &str, hits: usize) -> &mut Self {
        let mock = self
            .server
            .mock("GET", path)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body)
            .expect(hits)
            .create_async()
            .await;
        self.mocks.push(mock);
        self
    }

    /// `GET path` answers with `status` and an empty body, expected exactly `hits` times.
    pub async fn status(&mut self, path: &str, status: usize, hits: usize) -> &mut Self {
        let mock =
            self.server.mock("GET", path).with_status(status).expect(hits).create_async().await;
        self.mocks.push(mock);
        self
    }

    /// Asserts every registered mock was hit the expected number of times.
    pub async fn assert(&self) {
        for mock in &self.mocks {
            mock.assert_async().await;
        }
    }

    /// Asserts the registered mocks and removes them so the same paths can be re-mocked.
    pub async fn assert_and_clear(&mut self) {
        for mock in self.mocks.drain(..) {
            mock.assert_async().await;
            mock.remove_async().await;
        }
    }
}
