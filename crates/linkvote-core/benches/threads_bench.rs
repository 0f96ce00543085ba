use criterion::{criterion_group, criterion_main, Criterion};
use linkvote_core::{build_threads, Comment, CommentId, LinkId, UserId, VoteKind, VoteTransition};
use time::{Duration, OffsetDateTime};

fn mk_comments(link_id: LinkId, top_level: usize, replies_each: usize) -> Vec<Comment> {
    let mut comments = Vec::with_capacity(top_level * (replies_each + 1));
    let mut clock = 0_i64;
    for _ in 0..top_level {
        let parent = Comment {
            comment_id: CommentId::new(),
            link_id,
            user_id: UserId::new(),
            parent_id: None,
            author_name: "bench".to_string(),
            content: "top-level benchmark comment".to_string(),
            created_at: OffsetDateTime::UNIX_EPOCH + Duration::seconds(clock),
            updated_at: OffsetDateTime::UNIX_EPOCH + Duration::seconds(clock),
        };
        clock += 1;
        for _ in 0..replies_each {
            comments.push(Comment {
                comment_id: CommentId::new(),
                parent_id: Some(parent.comment_id),
                content: "reply benchmark comment".to_string(),
                created_at: OffsetDateTime::UNIX_EPOCH + Duration::seconds(clock),
                updated_at: OffsetDateTime::UNIX_EPOCH + Duration::seconds(clock),
                ..parent.clone()
            });
            clock += 1;
        }
        comments.push(parent);
    }
    comments
}

fn bench_build_threads(c: &mut Criterion) {
    let comments = mk_comments(LinkId::new(), 200, 5);
    c.bench_function("build_threads_200x5", |b| {
        b.iter(|| build_threads(std::hint::black_box(&comments)));
    });
}

fn bench_replay_transitions(c: &mut Criterion) {
    let casts = (0..1_000)
        .map(|index| if index % 3 == 0 { VoteKind::Down } else { VoteKind::Up })
        .collect::<Vec<_>>();
    c.bench_function("replay_1000_casts", |b| {
        b.iter(|| {
            let mut stored = None;
            let mut score = 0_i64;
            for requested in std::hint::black_box(&casts) {
                let transition = VoteTransition::decide(stored, *requested);
                score += transition.score_delta(*requested);
                stored = transition.resulting_stance(*requested).kind();
            }
            score
        });
    });
}

criterion_group!(benches, bench_build_threads, bench_replay_transitions);
criterion_main!(benches);
