//! Socket side of a connection.
//!
//! `establish` runs the handshake, then splits the stream: a writer task
//! drains the connection's outbound queue and the reader loop feeds the
//! record-marking decoder, handing each reassembled message to the connection
//! for correlation. Any read or write failure closes the connection.

use {
    crate::{
        codec::RecordMarkingCodec,
        connection::Connection,
        io_err,
        marshal::{self, Marshalled},
    },
    log::{debug, error, warn},
    std::{io, net::SocketAddr, sync::Arc},
    tokio::{
        io::{AsyncWriteExt, BufWriter},
        net::{
            TcpSocket,
            tcp::{OwnedReadHalf, OwnedWriteHalf},
        },
        sync::mpsc,
        time,
    },
    tokio_stream::StreamExt,
    tokio_util::codec::FramedRead,
};

pub(crate) async fn establish(conn: Arc<Connection>, socket: TcpSocket, addr: SocketAddr) {
    let limit = conn.config().connect_timeout;
    let stream = match time::timeout(limit, socket.connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return conn.connect_failed(&e),
        Err(_) => {
            let e = io_err!(TimedOut, format!("connect timed out after {:?}", limit));
            return conn.connect_failed(&e);
        }
    };

    if let Err(e) = stream.set_nodelay(true) {
        debug!("{}: could not disable nagle: {}", conn.target(), e);
    }
    let local = stream.local_addr().ok();
    let (read, write) = stream.into_split();

    let (tx, rx) = mpsc::unbounded_channel();
    if !conn.connected(tx, local) {
        return;
    }
    conn.track(tokio::spawn(write_loop(conn.clone(), write, rx)));

    read_loop(conn, read).await;
}

async fn read_loop(conn: Arc<Connection>, read: OwnedReadHalf) {
    let codec = RecordMarkingCodec::new().max_message_size(conn.config().max_message_size);
    let mut frames = FramedRead::new(read, codec);

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(message) => match marshal::xid_of(&message) {
                Some(xid) => conn.complete(xid, message),
                None => warn!(
                    "{}: dropping {} byte message without an xid",
                    conn.target(),
                    message.len()
                ),
            },
            Err(e) => {
                error!("{}: read failed: {}", conn.target(), e);
                conn.close();
                return;
            }
        }
    }

    debug!("{}: peer closed the connection", conn.target());
    conn.close();
}

async fn write_message(writer: &mut BufWriter<OwnedWriteHalf>, message: &Marshalled) -> io::Result<()> {
    for chunk in message.chunks() {
        writer.write_all(chunk).await?;
    }
    Ok(())
}

async fn write_loop(
    conn: Arc<Connection>,
    write: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<Marshalled>,
) {
    let mut writer = BufWriter::new(write);
    let mut unflushed = 0;

    while let Some(message) = queue.recv().await {
        let mut result = write_message(&mut writer, &message).await;
        unflushed += message.wire_len();

        // batch whatever is already queued into one flush
        if result.is_ok() && queue.is_empty() {
            result = writer.flush().await;
            conn.release_queued(unflushed);
            unflushed = 0;
        }

        if let Err(e) = result {
            error!(
                "{}: write of xid {:#010x} failed: {}",
                conn.target(),
                message.xid(),
                e
            );
            conn.release_queued(unflushed);
            conn.close();
            return;
        }
    }
}
