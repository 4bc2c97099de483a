// This is an implementation of a TFTP engine compliant with RFC 1350 plus
// the option negotiation extensions of RFC 2347/2348/2349.
//
// Transfer begins with a request to read or write a file. If the responder
// grants the request, the file is sent in lock-step blocks of 512 bytes
// (or whatever blksize was negotiated). Each data packet contains one block
// and must be acked before the next one is sent.
//
// Transfer identifiers (TIDs) are UDP ports: the requesting host sends the
// initial request to port 69, and each side then uses an ephemeral port of
// its own for the rest of the exchange. A datagram arriving from the wrong
// source address mid-transfer is the one error condition that does not
// terminate a connection: it is answered with ERROR(5) and otherwise
// ignored.
//
// Option negotiation (RFC 2347): a request may append (name, value) string
// pairs after the mode field. The responder answers with an OACK listing
// the options it accepted and their effective values; options it doesn't
// recognize are dropped silently. This engine understands:
//
//  - blksize (RFC 2348): data payload per block, 8..=65464;
//  - timeout (RFC 2349): per-packet retransmit timer in seconds, 1..=255;
//  - tsize   (RFC 2349): transfer size; 0 on a read request asks the
//    server to fill in the actual size.
//
// Normal termination is marked by a DATA packet shorter than the block
// size (empty, when the file divides evenly into blocks). Whoever sends
// the final ACK waits one timeout period before going away so it can
// re-answer a retransmitted final DATA — otherwise the sender of that DATA
// could never learn the transfer finished.
//
// Errors cause the connection to terminate. An ERROR packet is sent as a
// courtesy, never retransmitted and never acked; timeouts pick up the case
// where it gets lost.

pub mod buffer_pool;
pub mod client;
pub mod handler;
pub mod options;
pub mod processor;
pub mod server;
pub mod srv_conn;
pub mod tftp;

pub use client::{Client, ClientConfig, ClientError};
pub use handler::{FileHandler, FsHandler};
pub use server::{Server, ServerConfig};
