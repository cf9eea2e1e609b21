use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::BaseArg;
use crate::error::{Error, Result};
use crate::retry;
use crate::MSG_CHUNK_SIZE;

/// Netcat-like pipe: stdin goes to the peer, the peer's bytes go to
/// stdout, until either direction ends. No read/write deadline applies
/// here, a pipe may legitimately sit idle.
pub async fn run(code: String, length: usize, bearer: String, sigserv: String) -> Result<()> {
    let mut base = BaseArg::default();
    base.code = code;
    base.secret_length = length;
    base.bearer = bearer;
    base.sigserv = sigserv;

    let c = retry::connect(&base).await?;
    let stream = c.stream();

    let to_stdout = async {
        let mut stdout = tokio::io::stdout();
        let mut buf = vec![0u8; MSG_CHUNK_SIZE * 2];
        loop {
            let n = stream.recv(&mut buf).await?;
            if n == 0 {
                break;
            }
            stdout.write_all(&buf[..n]).await?;
            stdout.flush().await?;
        }
        Ok::<_, Error>(())
    };

    let from_stdin = async {
        let mut stdin = tokio::io::stdin();
        let mut buf = vec![0u8; MSG_CHUNK_SIZE];
        loop {
            let n = stdin.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            stream.send_all(&buf[..n]).await?;
        }
        Ok::<_, Error>(())
    };

    let result = tokio::select! {
        r = to_stdout => r,
        r = from_stdin => r,
    };
    c.close().await;
    result
}
