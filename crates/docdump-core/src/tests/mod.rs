mod parallel_dump;
