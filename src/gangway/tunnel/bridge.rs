use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const BRIDGE_BUFFER_BYTES: usize = 16 * 1024;

/// Copies bytes both ways until either side reaches EOF or fails, then shuts
/// down both write halves. Returns `(a_to_b, b_to_a)` byte counts.
pub async fn bridge<A, B>(a: A, b: B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ar, mut aw) = tokio::io::split(a);
    let (mut br, mut bw) = tokio::io::split(b);

    let mut a_to_b = 0u64;
    let mut b_to_a = 0u64;
    {
        let up = copy_half(&mut ar, &mut bw, &mut a_to_b);
        let down = copy_half(&mut br, &mut aw, &mut b_to_a);
        tokio::select! {
            res = up => {
                if let Err(err) = res {
                    tracing::debug!(err=%err, "bridge: upstream copy ended");
                }
            }
            res = down => {
                if let Err(err) = res {
                    tracing::debug!(err=%err, "bridge: downstream copy ended");
                }
            }
        }
    }

    let _ = aw.shutdown().await;
    let _ = bw.shutdown().await;
    (a_to_b, b_to_a)
}

async fn copy_half<R, W>(r: &mut R, w: &mut W, total: &mut u64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BRIDGE_BUFFER_BYTES];
    loop {
        let n = r.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        w.write_all(&buf[..n]).await?;
        w.flush().await?;
        *total += n as u64;
    }
}
