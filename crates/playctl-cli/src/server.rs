//! Socket transport for the service
//!
//! Each TCP connection is one bound client. The connection's outbound channel
//! is its callback handle: a `register` message adds it to the broadcaster and
//! every event is written back as one JSON line. Commands are run on the
//! blocking pool, one at a time per connection.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{ AtomicUsize, Ordering };
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{ AsyncBufReadExt, AsyncWriteExt, BufReader };
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{ TcpListener, TcpStream };
use tokio::sync::{ mpsc, Notify };

use playctl_core::{ Client, Dispatcher, Event, Request, Service };


/// Accepts connections until `shutdown` resolves, or, with `exit_when_idle`,
/// until the last bound client goes away.
pub async fn serve(
    service: Arc<Service>,
    listener: TcpListener,
    exit_when_idle: bool,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let bound = Arc::new( AtomicUsize::new( 0 ) );
    let idle = Arc::new( Notify::new() );
    tokio::pin!( shutdown );

    tracing::info!( "Listening on {}", listener.local_addr()? );

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let ( stream, peer ) = match accepted {
                    Ok( conn ) => conn,
                    Err( e ) => {
                        tracing::warn!( "Failed to accept connection: {}", e );
                        continue;
                    }
                };

                bound.fetch_add( 1, Ordering::SeqCst );
                tracing::info!( "Client {} has been bound", peer );

                let dispatcher = service.dispatcher();
                let bound = Arc::clone( &bound );
                let idle = Arc::clone( &idle );
                tokio::spawn( async move {
                    if let Err( e ) = handle_connection( stream, peer, dispatcher ).await {
                        tracing::warn!( "Connection {} failed: {}", peer, e );
                    }
                    tracing::info!( "Client {} has been unbound", peer );

                    if bound.fetch_sub( 1, Ordering::SeqCst ) == 1 && exit_when_idle {
                        idle.notify_one();
                    }
                });
            }
            _ = idle.notified() => {
                tracing::info!( "Last client unbound, shutting down" );
                break;
            }
            _ = &mut shutdown => {
                tracing::info!( "Shutdown requested" );
                break;
            }
        }
    }

    Ok(())
}


/// Runs one client connection to completion.
async fn handle_connection( stream: TcpStream, peer: SocketAddr, dispatcher: Dispatcher ) -> Result<()> {
    let ( reader, mut writer ) = stream.into_split();

    // The receiver lives in the writer task; once it is gone, deliveries to
    // this client fail and the broadcaster drops it
    let ( tx, mut rx ) = mpsc::unbounded_channel::<Event>();
    let client = Client::new( tx );

    let writer_task = tokio::spawn( async move {
        while let Some( event ) = rx.recv().await {
            let mut line = event.encode();
            line.push( '\n' );
            if let Err( e ) = writer.write_all( line.as_bytes() ).await {
                tracing::debug!( "Write to {} failed: {}", peer, e );
                break;
            }
        }
    });

    let result = read_requests( BufReader::new( reader ), peer, &client, &dispatcher ).await;

    // Wait for the writer to be dropped so the receiver is gone on every exit path
    writer_task.abort();
    let _ = writer_task.await;
    result
}


/// Decodes and dispatches lines until the peer closes the connection.
///
/// Lines that are not UTF-8 or not a valid message are logged and skipped.
async fn read_requests(
    mut reader: BufReader<OwnedReadHalf>,
    peer: SocketAddr,
    client: &Client,
    dispatcher: &Dispatcher,
) -> Result<()> {
    let mut buf = Vec::new();

    loop {
        buf.clear();
        if reader.read_until( b'\n', &mut buf ).await? == 0 {
            return Ok(());
        }

        let line = match std::str::from_utf8( &buf ) {
            Ok( line ) => line.trim(),
            Err( e ) => {
                tracing::warn!( "Ignoring non-UTF-8 line from {}: {}", peer, e );
                continue;
            }
        };
        if line.is_empty() {
            continue;
        }

        let request = match Request::decode( line ) {
            Ok( request ) => request,
            Err( e ) => {
                tracing::warn!( "Ignoring message from {}: {}", peer, e );
                continue;
            }
        };
        tracing::debug!( "{} -> {:?}", peer, request );

        let message = request.into_message( client );
        let dispatcher = dispatcher.clone();
        if let Err( e ) = tokio::task::spawn_blocking( move || dispatcher.dispatch( message ) ).await {
            tracing::error!( "Command from {} failed: {}", peer, e );
        }
    }
}


#[cfg( test )]
pub(crate) mod testing {
    use super::*;
    use std::time::Duration;

    use playctl_core::{ SimulatedPlayerFactory, SimulationConfig };
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;


    /// A service listening on an ephemeral port.
    pub struct TestServer {
        pub addr: SocketAddr,
        pub service: Arc<Service>,
        pub stop: oneshot::Sender<()>,
        pub task: JoinHandle<Result<()>>,
    }


    pub async fn start( exit_when_idle: bool ) -> TestServer {
        let factory = SimulatedPlayerFactory::new( SimulationConfig {
            max_players: 1,
            buffering_delay: Duration::from_millis( 10 ),
            track_length: Duration::from_secs( 60 ),
        });
        let service = Arc::new( Service::start( Arc::new( factory ) ).unwrap() );
        let listener = TcpListener::bind( "127.0.0.1:0" ).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ( stop, stop_rx ) = oneshot::channel::<()>();

        let task = tokio::spawn( serve( Arc::clone( &service ), listener, exit_when_idle, async move {
            let _ = stop_rx.await;
        }));
        TestServer { addr, service, stop, task }
    }


    /// Polls `condition` until it holds, panicking after five seconds.
    pub async fn wait_until( mut condition: impl FnMut() -> bool ) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs( 5 );
        while !condition() {
            assert!( tokio::time::Instant::now() < deadline, "condition not reached in time" );
            tokio::time::sleep( Duration::from_millis( 10 ) ).await;
        }
    }
}


#[cfg( test )]
mod tests {
    use super::testing::{ start, wait_until };
    use super::*;
    use std::time::Duration;

    use tokio::io::Lines;
    use tokio::net::tcp::OwnedWriteHalf;
    use tokio::time::timeout;


    type EventLines = Lines<BufReader<OwnedReadHalf>>;


    async fn connect( addr: SocketAddr ) -> ( EventLines, OwnedWriteHalf ) {
        let stream = TcpStream::connect( addr ).await.unwrap();
        let ( reader, writer ) = stream.into_split();
        ( BufReader::new( reader ).lines(), writer )
    }


    async fn send( writer: &mut OwnedWriteHalf, line: &[u8] ) {
        writer.write_all( line ).await.unwrap();
        writer.write_all( b"\n" ).await.unwrap();
    }


    async fn next_event( lines: &mut EventLines ) -> Event {
        let line = timeout( Duration::from_secs( 5 ), lines.next_line() )
            .await
            .expect( "timed out waiting for event" )
            .unwrap()
            .expect( "connection closed" );
        Event::decode( &line ).unwrap()
    }


    #[tokio::test( flavor = "multi_thread" )]
    async fn test_prepare_and_seek_over_socket() {
        let server = start( false ).await;
        let ( mut lines, mut writer ) = connect( server.addr ).await;

        let script: [&[u8]; 4] = [
            br#"{"what":1}"#,
            br#"{"what":999}"#,
            b"garbage",
            br#"{"what":100,"data":{"uri":"42","accessToken":"tok"}}"#,
        ];
        for line in script {
            send( &mut writer, line ).await;
        }

        assert_eq!( next_event( &mut lines ).await, Event::OnPrepared { uri: "42".into() } );

        send( &mut writer, br#"{"what":103,"data":{"ms":5000}}"# ).await;
        assert!( matches!(
            next_event( &mut lines ).await,
            Event::OnPlayerPositionChanged { position_ms: 5000, .. }
        ));

        server.stop.send( () ).unwrap();
        server.task.await.unwrap().unwrap();
    }


    #[tokio::test( flavor = "multi_thread" )]
    async fn test_invalid_utf8_keeps_connection_open() {
        let server = start( false ).await;
        let ( mut lines, mut writer ) = connect( server.addr ).await;

        send( &mut writer, br#"{"what":1}"# ).await;
        send( &mut writer, b"\xff\xfe" ).await;
        send( &mut writer, br#"{"what":100,"data":{"uri":"7","accessToken":"tok"}}"# ).await;

        assert_eq!( next_event( &mut lines ).await, Event::OnPrepared { uri: "7".into() } );
        assert_eq!( server.service.broadcaster().client_count(), 1 );

        server.stop.send( () ).unwrap();
        server.task.await.unwrap().unwrap();
    }


    #[tokio::test( flavor = "multi_thread" )]
    async fn test_disconnected_client_is_pruned() {
        let server = start( false ).await;
        let broadcaster = server.service.broadcaster();

        let ( mut lines_a, mut writer_a ) = connect( server.addr ).await;
        let ( mut lines_b, mut writer_b ) = connect( server.addr ).await;
        send( &mut writer_a, br#"{"what":1}"# ).await;
        send( &mut writer_b, br#"{"what":1}"# ).await;
        wait_until( || broadcaster.client_count() == 2 ).await;

        send( &mut writer_a, br#"{"what":100,"data":{"uri":"42","accessToken":"tok"}}"# ).await;
        assert_eq!( next_event( &mut lines_a ).await, Event::OnPrepared { uri: "42".into() } );
        assert_eq!( next_event( &mut lines_b ).await, Event::OnPrepared { uri: "42".into() } );

        // Bytes that are not UTF-8 must not end the session for B either
        send( &mut writer_b, b"\xff\xfe" ).await;
        drop( lines_b );
        drop( writer_b );

        // Every seek is broadcast; the first one after B's connection is
        // torn down removes it
        let deadline = tokio::time::Instant::now() + Duration::from_secs( 5 );
        while broadcaster.client_count() != 1 {
            assert!( tokio::time::Instant::now() < deadline, "disconnected client was never pruned" );
            send( &mut writer_a, br#"{"what":103,"data":{"ms":1000}}"# ).await;
            assert!( matches!(
                next_event( &mut lines_a ).await,
                Event::OnPlayerPositionChanged { position_ms: 1000, .. }
            ));
            tokio::time::sleep( Duration::from_millis( 10 ) ).await;
        }

        server.stop.send( () ).unwrap();
        server.task.await.unwrap().unwrap();
    }


    #[tokio::test( flavor = "multi_thread" )]
    async fn test_exit_when_idle() {
        let server = start( true ).await;

        let stream = TcpStream::connect( server.addr ).await.unwrap();
        drop( stream );

        let result = timeout( Duration::from_secs( 5 ), server.task ).await.expect( "server did not exit" );
        result.unwrap().unwrap();
    }
}
