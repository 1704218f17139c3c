//! Minimal client for a running service.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{ Context, Result };
use tokio::io::{ AsyncBufReadExt, AsyncWriteExt, BufReader };
use tokio::net::TcpStream;

use playctl_core::{ Event, Request };


/// Parses the text commands, sends them after registering, and prints events
/// until `wait` has passed without the connection closing.
pub async fn send( addr: SocketAddr, commands: &[String], wait: Duration ) -> Result<()> {
    let requests = commands
        .iter()
        .map( |c| Request::parse( c ).with_context( || format!( "Invalid command '{}'", c ) ) )
        .collect::<Result<Vec<_>>>()?;

    let stream = TcpStream::connect( addr )
        .await
        .with_context( || format!( "Failed to connect to {}", addr ) )?;
    let ( reader, mut writer ) = stream.into_split();

    let mut outgoing = vec![ Request::RegisterClient ];
    outgoing.extend( requests );
    for request in &outgoing {
        let mut line = request.encode();
        line.push( '\n' );
        writer.write_all( line.as_bytes() ).await?;
        tracing::debug!( "Sent {:?}", request );
    }

    let mut lines = BufReader::new( reader ).lines();
    let deadline = tokio::time::sleep( wait );
    tokio::pin!( deadline );

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            line = lines.next_line() => match line? {
                Some( line ) => match Event::decode( &line ) {
                    Ok( event ) => println!( "{}", event ),
                    Err( e ) => tracing::warn!( "Unreadable event: {}", e ),
                },
                None => {
                    tracing::info!( "Service closed the connection" );
                    return Ok(());
                }
            },
        }
    }

    let mut line = Request::UnregisterClient.encode();
    line.push( '\n' );
    writer.write_all( line.as_bytes() ).await?;
    writer.shutdown().await?;
    Ok(())
}


#[cfg( test )]
mod tests {
    use super::*;
    use crate::server::testing::{ start, wait_until };


    #[tokio::test( flavor = "multi_thread" )]
    async fn test_send_registers_runs_commands_and_unregisters() {
        let server = start( false ).await;
        let commands = vec![ "prepare 42 tok".to_string(), "seek 1:30".to_string() ];

        send( server.addr, &commands, Duration::from_millis( 200 ) ).await.unwrap();

        let session = server.service.session();
        wait_until( || session.prepared_uri().as_deref() == Some( "42" ) ).await;
        assert!( session.has_player() );

        let broadcaster = server.service.broadcaster();
        wait_until( || broadcaster.client_count() == 0 ).await;

        server.stop.send( () ).unwrap();
        server.task.await.unwrap().unwrap();
    }


    #[tokio::test]
    async fn test_send_rejects_invalid_command_before_connecting() {
        // Nothing listens here; parsing must fail first
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let err = send( addr, &[ "rewind".to_string() ], Duration::from_millis( 10 ) ).await.unwrap_err();
        assert!( err.to_string().contains( "rewind" ) );
    }
}
