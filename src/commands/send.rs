use crate::config::SendFilesArg;
use crate::error::Result;
use crate::retry;

/// Offer files and wait for a peer to collect them. With no code the
/// server assigns a slot and the code to share is printed once the
/// signalling connection is up.
pub async fn run(
    files: Vec<String>,
    code: String,
    length: usize,
    retry_times: u32,
    bearer: String,
    sigserv: String,
) -> Result<()> {
    let mut arg = SendFilesArg {
        files,
        ..Default::default()
    };
    arg.base.code = code;
    arg.base.secret_length = length;
    arg.base.retry_times = retry_times;
    arg.base.bearer = bearer;
    arg.base.sigserv = sigserv;
    arg.base.progress = true;

    retry::send_files_retry(&mut arg).await
}
