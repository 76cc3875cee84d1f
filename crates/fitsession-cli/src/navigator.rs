use anyhow::Result;
use fitsession_core::Navigator;
use url::Url;

/// A terminal can't follow a redirect, so the authorization URL is printed
/// for the user to open. The backend sends the browser back to the web app,
/// whose landing URL is then passed to `fitsession callback`.
pub struct TerminalNavigator {
    return_to: String,
}

impl TerminalNavigator {
    pub fn new(return_to: String) -> Self {
        Self { return_to }
    }
}

impl Navigator for TerminalNavigator {
    fn current_path(&self) -> String {
        self.return_to.clone()
    }

    fn navigate(&self, url: &Url) -> Result<()> {
        println!("Open this URL in your browser to sign in:");
        println!("  {}", url);
        println!("Then run `fitsession callback <landing url>` with the address you end up on.");
        Ok(())
    }
}
