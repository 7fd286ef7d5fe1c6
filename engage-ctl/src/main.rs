use anyhow::Context;
use engage_api::{CommentId, Fingerprint, NewComment, NewView, Uuid};

#[derive(structopt::StructOpt)]
struct Opt {
    #[structopt(short, long, default_value = "http://127.0.0.1:3000")]
    host: String,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(structopt::StructOpt)]
enum Command {
    /// Post a comment, signed in if SESSION_TOKEN is set
    Comment {
        subject: String,

        body: String,

        #[structopt(long)]
        name: Option<String>,

        #[structopt(long)]
        email: Option<String>,

        /// Id of the comment being replied to
        #[structopt(long)]
        parent: Option<Uuid>,
    },

    /// Print the published discussion of a subject
    Thread { subject: String },

    /// Record a view of a subject
    View {
        subject: String,

        #[structopt(long)]
        referrer: Option<String>,
    },

    /// Print the view counters of a subject
    Stats { subject: String },

    /// Print the fingerprint an address hashes to, salted with FINGERPRINT_SALT
    Fingerprint { address: String },
}

fn session_token() -> anyhow::Result<Option<Uuid>> {
    match std::env::var("SESSION_TOKEN") {
        Err(std::env::VarError::NotPresent) => Ok(None),
        tok => {
            let tok = tok.context("retrieving SESSION_TOKEN environment variable")?;
            let tok = Uuid::try_parse(&tok).context("parsing SESSION_TOKEN as a uuid")?;
            Ok(Some(tok))
        }
    }
}

async fn send(req: reqwest::RequestBuilder) -> anyhow::Result<serde_json::Value> {
    let resp = req.send().await.context("sending request")?;
    let status = resp.status();
    let body = resp.bytes().await.context("reading response body")?;
    if !status.is_success() {
        let err = engage_api::Error::parse(&body)
            .with_context(|| format!("server answered {status} with an unexpected body"))?;
        return Err(err).context("server refused the request");
    }
    serde_json::from_slice(&body).context("parsing response body")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = <Opt as structopt::StructOpt>::from_args();

    let client = reqwest::Client::new();
    let subject_url = |subject: &str, what: &str| format!("{}/api/subjects/{subject}/{what}", opt.host);

    let res = match opt.cmd {
        Command::Comment {
            subject,
            body,
            name,
            email,
            parent,
        } => {
            let req = client
                .post(subject_url(&subject, "comments"))
                .json(&NewComment {
                    parent_id: parent.map(CommentId),
                    body,
                    author_name: name,
                    author_email: email,
                });
            let req = match session_token()? {
                Some(tok) => req.bearer_auth(tok),
                None => req,
            };
            send(req).await?
        }
        Command::Thread { subject } => send(client.get(subject_url(&subject, "comments"))).await?,
        Command::View { subject, referrer } => {
            send(
                client
                    .post(subject_url(&subject, "views"))
                    .json(&NewView { referrer }),
            )
            .await?
        }
        Command::Stats { subject } => send(client.get(subject_url(&subject, "stats"))).await?,
        Command::Fingerprint { address } => {
            let salt = std::env::var("FINGERPRINT_SALT")
                .context("retrieving FINGERPRINT_SALT environment variable")?;
            println!("{}", Fingerprint::of(Some(&address), &salt));
            return Ok(());
        }
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&res).context("pretty-printing response")?
    );

    Ok(())
}
