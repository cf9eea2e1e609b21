use crate::config::ReceiveFilesArg;
use crate::error::Result;
use crate::retry;

/// Collect files from a peer. With no code we allocate the slot and
/// print the code for the sender to dial.
pub async fn run(
    code: String,
    dir: String,
    length: usize,
    retry_times: u32,
    db: String,
    bearer: String,
    sigserv: String,
) -> Result<()> {
    let mut arg = ReceiveFilesArg {
        dir,
        data_source_name: db,
        ..Default::default()
    };
    arg.base.code = code;
    arg.base.secret_length = length;
    arg.base.retry_times = retry_times;
    arg.base.bearer = bearer;
    arg.base.sigserv = sigserv;
    arg.base.progress = true;

    retry::receive_files_retry(&mut arg).await
}
