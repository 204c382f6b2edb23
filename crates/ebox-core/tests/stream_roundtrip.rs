//! Stream container: large roundtrips, truncation, reordering, tampering.

use ebox_core::{
    ConfigKind, EboxStream, EboxTemplate, Error, TemplateConfig, TemplatePart,
};
use ebox_crypto::EcKeyPair;
use rand::RngCore;

const CHUNK: u32 = 128 * 1024;

fn primary_template(holder: &EcKeyPair) -> EboxTemplate {
    let mut config = TemplateConfig::new(ConfigKind::Primary);
    config
        .add_part(TemplatePart::new(holder.public_key().clone()))
        .unwrap();
    let mut tpl = EboxTemplate::new();
    tpl.add_config(config).unwrap();
    tpl
}

fn drain(stream: &mut EboxStream, out: &mut Vec<u8>) {
    let mut buf = [0u8; 8192];
    loop {
        let n = stream.get(&mut [&mut buf[..]]).unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
}

fn encrypt_all(holder: &EcKeyPair, plaintext: &[u8]) -> Vec<u8> {
    let tpl = primary_template(holder);
    let mut stream = EboxStream::init_encrypt_with_chunk_size(&tpl, CHUNK).unwrap();

    let mut ciphertext = Vec::new();
    let mut offset = 0;
    while offset < plaintext.len() {
        let n = stream.put(&[&plaintext[offset..]]).unwrap();
        offset += n;
        drain(&mut stream, &mut ciphertext);
    }
    stream.close().unwrap();
    drain(&mut stream, &mut ciphertext);
    ciphertext
}

/// Feed ciphertext into a decrypt stream, unlocking the embedded ebox with
/// `holder` as soon as the header has been parsed. Returns the plaintext
/// produced before the first error, along with that error if any.
fn decrypt_all(holder: &EcKeyPair, ciphertext: &[u8]) -> (Vec<u8>, Option<Error>) {
    let mut stream = EboxStream::init_decrypt();
    let mut plaintext = Vec::new();
    let mut unlocked = false;
    let mut offset = 0;

    while offset < ciphertext.len() {
        let n = match stream.put(&[&ciphertext[offset..]]) {
            Ok(n) => n,
            Err(e) => return (plaintext, Some(e)),
        };
        offset += n;

        if !unlocked {
            if let Some(ebox) = stream.ebox_mut() {
                ebox.config_mut(0)
                    .unwrap()
                    .part_mut(0)
                    .unwrap()
                    .sealed_box_mut()
                    .unseal(holder)
                    .unwrap();
                ebox.unlock(0).unwrap();
                unlocked = true;
            }
        }

        let mut buf = [0u8; 8192];
        loop {
            match stream.get(&mut [&mut buf[..]]) {
                Ok(0) => break,
                Ok(n) => plaintext.extend_from_slice(&buf[..n]),
                Err(e) => return (plaintext, Some(e)),
            }
        }
    }

    match stream.close() {
        Ok(()) => (plaintext, None),
        Err(e) => (plaintext, Some(e)),
    }
}

fn sample_plaintext(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

#[test]
fn three_chunk_roundtrip() {
    let holder = EcKeyPair::from_seed(&[0x31; 32]);
    // 300 KiB: two full 128 KiB chunks plus a short final chunk.
    let plaintext = sample_plaintext(300 * 1024);

    let ciphertext = encrypt_all(&holder, &plaintext);
    let (decrypted, err) = decrypt_all(&holder, &ciphertext);
    assert!(err.is_none(), "unexpected error: {err:?}");
    assert_eq!(decrypted, plaintext);
}

#[test]
fn empty_stream_roundtrip() {
    let holder = EcKeyPair::from_seed(&[0x32; 32]);
    let ciphertext = encrypt_all(&holder, &[]);
    let (decrypted, err) = decrypt_all(&holder, &ciphertext);
    assert!(err.is_none());
    assert!(decrypted.is_empty());
}

#[test]
fn truncated_stream_is_corrupt_after_verified_chunks() {
    let holder = EcKeyPair::from_seed(&[0x33; 32]);
    let plaintext = sample_plaintext(300 * 1024);
    let ciphertext = encrypt_all(&holder, &plaintext);

    let (decrypted, err) = decrypt_all(&holder, &ciphertext[..ciphertext.len() - 1]);
    assert!(matches!(err, Some(Error::Corrupt(_))), "got {err:?}");
    // Nothing beyond the verified chunks is ever produced.
    assert!(decrypted.len() <= plaintext.len());
    assert_eq!(decrypted, plaintext[..decrypted.len()]);
}

#[test]
fn tampered_chunk_is_corrupt_and_stops_output() {
    let holder = EcKeyPair::from_seed(&[0x34; 32]);
    let plaintext = sample_plaintext(300 * 1024);
    let mut ciphertext = encrypt_all(&holder, &plaintext);

    // Flip a byte inside the second chunk's ciphertext.
    let header_len = header_len_of(&ciphertext);
    let first_frame = frame_len_at(&ciphertext, header_len);
    let target = header_len + first_frame + 12 + 100;
    ciphertext[target] ^= 0x01;

    let (decrypted, err) = decrypt_all(&holder, &ciphertext);
    assert!(matches!(err, Some(Error::Corrupt(_))), "got {err:?}");
    // Only the first (verified) chunk was emitted.
    assert_eq!(decrypted.len(), CHUNK as usize);
    assert_eq!(decrypted, plaintext[..CHUNK as usize]);
}

#[test]
fn reordered_chunks_are_corrupt() {
    let holder = EcKeyPair::from_seed(&[0x35; 32]);
    let plaintext = sample_plaintext(300 * 1024);
    let ciphertext = encrypt_all(&holder, &plaintext);

    // Swap the first two chunk frames.
    let header_len = header_len_of(&ciphertext);
    let first = frame_len_at(&ciphertext, header_len);
    let second = frame_len_at(&ciphertext, header_len + first);

    let mut reordered = ciphertext[..header_len].to_vec();
    reordered.extend_from_slice(&ciphertext[header_len + first..header_len + first + second]);
    reordered.extend_from_slice(&ciphertext[header_len..header_len + first]);
    reordered.extend_from_slice(&ciphertext[header_len + first + second..]);

    let (decrypted, err) = decrypt_all(&holder, &reordered);
    assert!(matches!(err, Some(Error::Corrupt(_))), "got {err:?}");
    assert!(decrypted.is_empty());
}

#[test]
fn repeated_chunk_is_corrupt() {
    let holder = EcKeyPair::from_seed(&[0x36; 32]);
    let plaintext = sample_plaintext(256 * 1024);
    let ciphertext = encrypt_all(&holder, &plaintext);

    let header_len = header_len_of(&ciphertext);
    let first = frame_len_at(&ciphertext, header_len);

    let mut repeated = ciphertext[..header_len + first].to_vec();
    repeated.extend_from_slice(&ciphertext[header_len..header_len + first]);
    repeated.extend_from_slice(&ciphertext[header_len + first..]);

    let (decrypted, err) = decrypt_all(&holder, &repeated);
    assert!(matches!(err, Some(Error::Corrupt(_))), "got {err:?}");
    assert_eq!(decrypted.len(), CHUNK as usize);
}

#[test]
fn cross_vector_boundaries_do_not_affect_framing() {
    let holder = EcKeyPair::from_seed(&[0x37; 32]);
    let plaintext = sample_plaintext(100 * 1024);

    // Encrypt through many tiny scattered slices.
    let tpl = primary_template(&holder);
    let mut stream = EboxStream::init_encrypt_with_chunk_size(&tpl, 4096).unwrap();
    let mut ciphertext = Vec::new();
    for piece in plaintext.chunks(977) {
        let halves = piece.split_at(piece.len() / 2);
        let mut offset = 0;
        let slices = [halves.0, halves.1];
        while offset < piece.len() {
            // Re-slice past what was already consumed.
            let mut remaining: Vec<&[u8]> = Vec::new();
            let mut skip = offset;
            for s in slices {
                if skip >= s.len() {
                    skip -= s.len();
                } else {
                    remaining.push(&s[skip..]);
                    skip = 0;
                }
            }
            offset += stream.put(&remaining).unwrap();
            drain(&mut stream, &mut ciphertext);
        }
    }
    stream.close().unwrap();
    drain(&mut stream, &mut ciphertext);

    let (decrypted, err) = decrypt_all(&holder, &ciphertext);
    assert!(err.is_none());
    assert_eq!(decrypted, plaintext);
}

// -- wire math helpers --------------------------------------------------

fn header_len_of(ciphertext: &[u8]) -> usize {
    let ebox_len = u32::from_be_bytes(ciphertext[10..14].try_into().unwrap()) as usize;
    14 + ebox_len
}

fn frame_len_at(ciphertext: &[u8], offset: usize) -> usize {
    let ct_len =
        u32::from_be_bytes(ciphertext[offset + 8..offset + 12].try_into().unwrap()) as usize;
    12 + ct_len
}
