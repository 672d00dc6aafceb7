use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "taskdesk", version, about = "Command line client for the taskdesk task API")]
pub struct Cli {
    /// API base URL (overrides config and TASKDESK_BASE_URL)
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Log in and store the issued credentials
    Login {
        /// Defaults to the last username used
        #[arg(short, long)]
        username: Option<String>,
    },

    /// Forget the stored credentials
    Logout,

    /// Show whether a session is stored and when it expires
    Status,

    /// Send an arbitrary request to the API
    Request {
        /// HTTP method (GET, POST, PUT, PATCH, DELETE)
        method: String,

        /// Path relative to the base URL, e.g. /api/taches/
        path: String,

        /// JSON request body
        #[arg(short, long)]
        data: Option<String>,
    },

    /// List tasks
    Tasks,

    /// List projects
    Projects,

    /// Show the logged-in user's profile
    Profile,
}
